use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type PageId = u64;
pub type ChangeId = u64;
pub type FileId = u64;

pub const CHANGE_TYPE_CONTENT_CHANGED: &str = "content_changed";

/// How often a page should be checked.
///
/// Stored as its wire name (`5_minutes`, `hourly`, ...). Reading an unknown
/// stored value yields [`Frequency::Hourly`]; parsing user input with
/// [`FromStr`] rejects it instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Frequency {
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    #[default]
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub const ALL: [Frequency; 6] = [
        Frequency::FiveMinutes,
        Frequency::FifteenMinutes,
        Frequency::ThirtyMinutes,
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::FiveMinutes => "5_minutes",
            Frequency::FifteenMinutes => "15_minutes",
            Frequency::ThirtyMinutes => "30_minutes",
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }

    pub fn interval(self) -> Duration {
        match self {
            Frequency::FiveMinutes => Duration::minutes(5),
            Frequency::FifteenMinutes => Duration::minutes(15),
            Frequency::ThirtyMinutes => Duration::minutes(30),
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().to_ascii_lowercase();
        Frequency::ALL
            .into_iter()
            .find(|freq| freq.as_str() == raw)
            .ok_or_else(|| {
                let expected = Frequency::ALL.map(Frequency::as_str).join(", ");
                anyhow::anyhow!("invalid frequency {raw:?}. expected one of: {expected}")
            })
    }
}

impl From<String> for Frequency {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(frequency = %raw, "unrecognized stored frequency; using hourly");
            Frequency::Hourly
        })
    }
}

impl From<Frequency> for String {
    fn from(freq: Frequency) -> Self {
        freq.as_str().to_owned()
    }
}

/// Conditional-request validators cached from the previous fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoredPage {
    pub id: PageId,
    pub name: Option<String>,
    pub url: String,
    pub css_selector: Option<String>,
    pub frequency: Frequency,
    pub is_active: bool,

    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub last_content_hash: Option<String>,
    pub last_etag: Option<String>,
    pub last_modified: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl MonitoredPage {
    pub fn validators(&self) -> Validators {
        Validators {
            etag: self.last_etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPage {
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub css_selector: Option<String>,
    #[serde(default, deserialize_with = "strict_frequency::required")]
    pub frequency: Frequency,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Partial update of the user-editable page fields.
///
/// `css_selector: Some(None)` clears the selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, with = "double_option")]
    pub css_selector: Option<Option<String>>,
    #[serde(default, deserialize_with = "strict_frequency::optional")]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Frequencies coming from users are parsed strictly.
mod strict_frequency {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    use super::Frequency;

    pub fn required<'de, D>(deserializer: D) -> Result<Frequency, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|err| D::Error::custom(format!("{err:#}")))
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<Frequency>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|err| D::Error::custom(format!("{err:#}"))),
            None => Ok(None),
        }
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<String>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageChange {
    pub id: ChangeId,
    pub page_id: PageId,
    pub detected_at: DateTime<Utc>,
    pub change_type: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeDetails {
    pub previous_hash: Option<String>,
    pub new_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadedFile {
    pub id: FileId,
    pub page_id: PageId,
    pub change_id: Option<ChangeId>,
    pub original_url: String,
    pub original_filename: String,
    pub stored_path: String,
    pub file_size: u64,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    pub downloaded_at: DateTime<Utc>,
}

/// A successfully stored file that has not been recorded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDownloadedFile {
    pub change_id: Option<ChangeId>,
    pub original_url: String,
    pub original_filename: String,
    pub stored_path: String,
    pub file_size: u64,
    pub content_type: Option<String>,
    pub content_hash: Option<String>,
    pub downloaded_at: DateTime<Utc>,
}
