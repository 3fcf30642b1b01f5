use serde::{Deserialize, Serialize};

/// Numeric status emitted at the end of every robot message and recorded on
/// the job that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Hello,
    Queued,
    SuccessfulMerge,
    IncorrectPrefix,
    IncompatibleBranch,
    MissingIssue,
    IssueNotFound,
    SubtaskIssue,
    WrongProject,
    TypePrefixMismatch,
    FixVersionMismatch,
    HistoryMismatch,
    Conflict,
    MissingApprovals,
    BuildFailed,
    AfterPullRequest,
    IntegrationDataCreated,
    ResetComplete,
    UnknownCommand,
    NotAuthorized,
    PartialMerge,
    QueueConflict,
    QueueOutOfOrder,
    ResetHistoryMismatch,
    InternalError,
    SourceDiverged,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Hello => 100,
            StatusCode::Queued => 101,
            StatusCode::SuccessfulMerge => 102,
            StatusCode::IncorrectPrefix => 105,
            StatusCode::IncompatibleBranch => 106,
            StatusCode::MissingIssue => 107,
            StatusCode::IssueNotFound => 108,
            StatusCode::SubtaskIssue => 109,
            StatusCode::WrongProject => 110,
            StatusCode::TypePrefixMismatch => 111,
            StatusCode::FixVersionMismatch => 112,
            StatusCode::HistoryMismatch => 113,
            StatusCode::Conflict => 114,
            StatusCode::MissingApprovals => 115,
            StatusCode::BuildFailed => 118,
            StatusCode::AfterPullRequest => 120,
            StatusCode::IntegrationDataCreated => 121,
            StatusCode::ResetComplete => 126,
            StatusCode::UnknownCommand => 122,
            StatusCode::NotAuthorized => 123,
            StatusCode::PartialMerge => 125,
            StatusCode::QueueConflict => 130,
            StatusCode::QueueOutOfOrder => 131,
            StatusCode::ResetHistoryMismatch => 132,
            StatusCode::InternalError => 133,
            StatusCode::SourceDiverged => 134,
        }
    }

    /// Statuses after which the PR needs no further evaluation.
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusCode::SuccessfulMerge | StatusCode::PartialMerge)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_values() {
        assert_eq!(StatusCode::Hello.code(), 100);
        assert_eq!(StatusCode::SuccessfulMerge.code(), 102);
        assert_eq!(StatusCode::Conflict.code(), 114);
        assert_eq!(StatusCode::BuildFailed.code(), 118);
        assert_eq!(StatusCode::SourceDiverged.code(), 134);
    }

    #[test]
    fn only_merges_are_terminal() {
        assert!(StatusCode::SuccessfulMerge.is_terminal());
        assert!(StatusCode::PartialMerge.is_terminal());
        assert!(!StatusCode::Hello.is_terminal());
        assert!(!StatusCode::Conflict.is_terminal());
    }
}
