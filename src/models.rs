use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type EmailId = i64;

/// The server writes timestamps as `YYYY-MM-DD HH:MM:SS` without an offset.
mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub id: EmailId,
    pub subject: String,
    pub body: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(with = "timestamp")]
    pub created_at: NaiveDateTime,
    // List payloads omit some flags; the folder fills them in (see Folder::apply_implied_flags)
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub is_spam: bool,
    #[serde(default)]
    pub is_archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Folder {
    #[default]
    Inbox,
    Read,
    Sent,
    Spam,
    Archived,
}

/// What the presentation layer may offer while a folder is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderCapabilities {
    pub show_archive_toggle: bool,
    pub show_read_toggle: bool,
    pub offers_compose: bool,
    pub empty_message: &'static str,
}

impl Folder {
    pub const ALL: [Folder; 5] = [
        Folder::Inbox,
        Folder::Read,
        Folder::Sent,
        Folder::Spam,
        Folder::Archived,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Folder::Inbox => "Inbox",
            Folder::Read => "Read",
            Folder::Sent => "Sent",
            Folder::Spam => "Spam",
            Folder::Archived => "Archived",
        }
    }

    /// Server collection key, used both in the path and in the response body.
    pub fn collection(self) -> &'static str {
        match self {
            Folder::Inbox => "received",
            Folder::Read => "read",
            Folder::Sent => "sent",
            Folder::Spam => "spam",
            Folder::Archived => "archived",
        }
    }

    pub fn endpoint(self) -> String {
        format!("/emails/{}", self.collection())
    }

    pub fn response_key(self) -> String {
        format!("{}_emails", self.collection())
    }

    pub fn capabilities(self) -> FolderCapabilities {
        match self {
            Folder::Inbox => FolderCapabilities {
                show_archive_toggle: true,
                show_read_toggle: true,
                offers_compose: true,
                empty_message: "Your inbox is empty.",
            },
            Folder::Read => FolderCapabilities {
                show_archive_toggle: true,
                show_read_toggle: false,
                offers_compose: false,
                empty_message: "You don't have any read emails.",
            },
            Folder::Sent => FolderCapabilities {
                show_archive_toggle: false,
                show_read_toggle: false,
                offers_compose: false,
                empty_message: "You haven't sent any emails yet.",
            },
            Folder::Spam => FolderCapabilities {
                show_archive_toggle: true,
                show_read_toggle: false,
                offers_compose: false,
                empty_message: "No spam emails detected.",
            },
            Folder::Archived => FolderCapabilities {
                show_archive_toggle: true,
                show_read_toggle: true,
                offers_compose: false,
                empty_message: "You haven't archived any emails yet.",
            },
        }
    }

    /// Membership in a folder implies some flags the list payload leaves out.
    pub fn apply_implied_flags(self, email: &mut Email) {
        match self {
            Folder::Inbox => {
                email.is_archived = false;
                email.is_spam = false;
            }
            Folder::Read => email.is_read = true,
            Folder::Spam => email.is_spam = true,
            Folder::Archived => email.is_archived = true,
            Folder::Sent => {}
        }
    }

    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|f| *f == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }

    pub fn prev(self) -> Self {
        let idx = Self::ALL.iter().position(|f| *f == self).unwrap_or(0);
        Self::ALL[(idx + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Read,
    Unread,
    Archive,
    Unarchive,
    Delete,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Read => "read",
            ActionKind::Unread => "unread",
            ActionKind::Archive => "archive",
            ActionKind::Unarchive => "unarchive",
            ActionKind::Delete => "delete",
        }
    }

    /// Human-readable phrase for status messages
    pub fn description(self) -> &'static str {
        match self {
            ActionKind::Read => "mark email as read",
            ActionKind::Unread => "mark email as unread",
            ActionKind::Archive => "archive email",
            ActionKind::Unarchive => "unarchive email",
            ActionKind::Delete => "delete email",
        }
    }

    /// Toggle resolution for the read/unread key.
    pub fn toggle_read(email: &Email) -> Self {
        if email.is_read {
            ActionKind::Unread
        } else {
            ActionKind::Read
        }
    }

    pub fn toggle_archive(email: &Email) -> Self {
        if email.is_archived {
            ActionKind::Unarchive
        } else {
            ActionKind::Archive
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Request and response bodies

#[derive(Debug, Deserialize)]
pub struct AuthCheckResponse {
    pub authenticated: bool,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Deserialize)]
pub struct SentEmailResponse {
    pub email: Email,
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub recipient_id: UserId,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct ActionBody {
    pub action: ActionKind,
}
