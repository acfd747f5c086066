use std::fmt;
use std::str::FromStr;

/// Folder an individual email is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderLabel {
    Inbox,
    Sent,
    Draft,
}

impl FolderLabel {
    /// "inbox" or "important" win, then "sent", then "draft". Unlabelled mail is inbox.
    pub fn classify<S: AsRef<str>>(sys_labels: &[S]) -> Self {
        let has = |wanted: &str| {
            sys_labels
                .iter()
                .any(|label| label.as_ref().eq_ignore_ascii_case(wanted))
        };

        if has("inbox") || has("important") {
            FolderLabel::Inbox
        } else if has("sent") {
            FolderLabel::Sent
        } else if has("draft") {
            FolderLabel::Draft
        } else {
            FolderLabel::Inbox
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FolderLabel::Inbox => "inbox",
            FolderLabel::Sent => "sent",
            FolderLabel::Draft => "draft",
        }
    }
}

impl fmt::Display for FolderLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFolderLabel(pub String);

impl fmt::Display for UnknownFolderLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown folder label: {}", self.0)
    }
}

impl std::error::Error for UnknownFolderLabel {}

impl FromStr for FolderLabel {
    type Err = UnknownFolderLabel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inbox" => Ok(FolderLabel::Inbox),
            "sent" => Ok(FolderLabel::Sent),
            "draft" => Ok(FolderLabel::Draft),
            other => Err(UnknownFolderLabel(other.to_string())),
        }
    }
}

/// Denormalized thread flags. Exactly one is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFolders {
    pub inbox: bool,
    pub draft: bool,
    pub sent: bool,
}

impl ThreadFolders {
    pub fn only(label: FolderLabel) -> Self {
        Self {
            inbox: label == FolderLabel::Inbox,
            draft: label == FolderLabel::Draft,
            sent: label == FolderLabel::Sent,
        }
    }

    /// Fold the labels of a thread's emails, oldest first.
    ///
    /// Starts from sent; a draft moves the thread to draft and an inbox email
    /// moves it to inbox, which later drafts cannot undo.
    pub fn from_labels(labels: impl IntoIterator<Item = FolderLabel>) -> Self {
        let mut current = FolderLabel::Sent;
        for label in labels {
            match label {
                FolderLabel::Inbox => current = FolderLabel::Inbox,
                FolderLabel::Draft if current != FolderLabel::Inbox => {
                    current = FolderLabel::Draft
                }
                _ => {}
            }
        }
        Self::only(current)
    }
}
