//! Keyword triage of a finished analysis to an owning team.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Analysis;

const SECURITY_KEYWORDS: &[&str] = &[
    "forbidden",
    "unauthorized",
    "tls handshake",
    "certificate",
    "secret",
    "token",
    "rbac",
    "psp",
    "policy",
    "security",
    "encryption",
];

const INFRA_KEYWORDS: &[&str] = &[
    "failedscheduling",
    "failed scheduling",
    "insufficient",
    "nodepressure",
    "taint",
    "toleration",
    "cni",
    "network plugin",
    "persistentvolume",
    "pv ",
    "pvc ",
    "storage",
    "dns",
    "connection timeout",
    "imagepullbackoff",
    "errimagepull",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageTeam {
    Application,
    Infra,
    Security,
}

impl TriageTeam {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Infra => "infra",
            Self::Security => "security",
        }
    }
}

impl fmt::Display for TriageTeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageDecision {
    pub team: TriageTeam,
    pub reason: &'static str,
}

/// Classify an analysis. `context` carries the other evidence gathered for
/// the job (phase, event reasons, alert descriptions).
pub fn triage(analysis: &Analysis, context: &str) -> TriageDecision {
    let text = [
        analysis.summary.as_str(),
        analysis.likely_cause.as_str(),
        analysis.details.as_deref().unwrap_or_default(),
        context,
    ]
    .join(" ")
    .to_lowercase();

    let mentions = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if mentions(SECURITY_KEYWORDS) {
        TriageDecision {
            team: TriageTeam::Security,
            reason: "Security-related keywords detected (permissions, secrets, TLS).",
        }
    } else if mentions(INFRA_KEYWORDS) {
        TriageDecision {
            team: TriageTeam::Infra,
            reason: "Infrastructure symptoms detected (scheduling, networking, storage).",
        }
    } else {
        TriageDecision {
            team: TriageTeam::Application,
            reason: "Defaulted to application owners after no infra/security signals were found.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    fn analysis(summary: &str, cause: &str) -> Analysis {
        Analysis {
            summary: summary.to_string(),
            likely_cause: cause.to_string(),
            recommended_steps: Vec::new(),
            severity: Severity::High,
            details: None,
        }
    }

    #[test]
    fn test_security_wins_over_infra() {
        let decision = triage(
            &analysis("Pods stuck in ImagePullBackOff", "registry returned 401 Unauthorized"),
            "",
        );
        assert_eq!(decision.team, TriageTeam::Security);
    }

    #[test]
    fn test_infra_from_context() {
        let decision = triage(
            &analysis("Rollout did not complete", "new pods never started"),
            "FailedScheduling: 0/3 nodes available: Insufficient cpu",
        );
        assert_eq!(decision.team, TriageTeam::Infra);
    }

    #[test]
    fn test_defaults_to_application() {
        let decision = triage(
            &analysis("Web crashes on boot", "nil pointer in config loader"),
            "CrashLoopBackOff",
        );
        assert_eq!(decision.team, TriageTeam::Application);
        assert!(decision.reason.starts_with("Defaulted"));
    }
}
