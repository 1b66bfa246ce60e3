//! File categories and filename conventions
//!
//! Remote filenames carry a `YYYYMMDD_HHMMSS` timestamp token, e.g.
//! `de_dev_ho_pwhg_data_0-2_20151122_120000.csv`. A data file is ready once
//! its control file (the same name plus `.ok`, or with the extension
//! replaced by `.ok`) appears next to it.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Suffix of control files
pub const OK_SUFFIX: &str = ".ok";

/// Name of the wildcard category
pub const ALL_FILES_NAME: &str = "all_files";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

static TIMESTAMP_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"(\d{8})_(\d{6})").unwrap()
});

/// How a control file name maps to its data file name
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataFileNaming {
    /// `a.csv.ok` → `a.csv`
    #[default]
    StripOkSuffix,
    /// `a.ok` → `a.<extension>`
    ReplaceOkSuffix { extension: String },
}

/// Serialized form of a [`FileType`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTypeDefinition {
    pub name: String,
    /// Regex searched in the data filename; absent for a wildcard
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub data_naming: DataFileNaming,
}

/// A category of remote files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FileTypeDefinition", into = "FileTypeDefinition")]
pub struct FileType {
    name: String,
    pattern: Option<Regex>,
    data_naming: DataFileNaming,
}

impl FileType {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Some(Regex::new(pattern)?),
            data_naming: DataFileNaming::default(),
        })
    }

    /// Wildcard category: any filename carrying a timestamp token
    pub fn all_files() -> Self {
        Self {
            name: ALL_FILES_NAME.to_string(),
            pattern: None,
            data_naming: DataFileNaming::default(),
        }
    }

    pub fn with_data_naming(mut self, naming: DataFileNaming) -> Self {
        self.data_naming = naming;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(Regex::as_str)
    }

    pub fn data_naming(&self) -> &DataFileNaming {
        &self.data_naming
    }

    pub fn is_wildcard(&self) -> bool {
        self.pattern.is_none()
    }

    fn matches_name(&self, filename: &str) -> bool {
        match self.pattern {
            Some(ref pattern) => pattern.is_match(filename),
            None => TIMESTAMP_TOKEN.is_match(filename),
        }
    }
}

impl PartialEq for FileType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.pattern() == other.pattern()
            && self.data_naming == other.data_naming
    }
}

impl TryFrom<FileTypeDefinition> for FileType {
    type Error = regex::Error;

    fn try_from(definition: FileTypeDefinition) -> Result<Self, Self::Error> {
        let pattern = definition.pattern.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            name: definition.name,
            pattern,
            data_naming: definition.data_naming,
        })
    }
}

impl From<FileType> for FileTypeDefinition {
    fn from(file_type: FileType) -> Self {
        Self {
            pattern: file_type.pattern().map(str::to_string),
            name: file_type.name,
            data_naming: file_type.data_naming,
        }
    }
}

/// `YYYYMMDD_HHMMSS` token of a filename, if any (the first valid one)
pub fn embedded_timestamp(filename: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_TOKEN.captures_iter(filename).find_map(|caps| {
        let token = format!("{}{}", &caps[1], &caps[2]);
        NaiveDateTime::parse_from_str(&token, TIMESTAMP_FORMAT).ok()
    })
}

/// Whether `filename` belongs to `file_type` and, when bounds are given,
/// carries a timestamp within `[date_from, date_to]`
pub fn matches(
    filename: &str,
    file_type: &FileType,
    date_from: Option<NaiveDateTime>,
    date_to: Option<NaiveDateTime>,
) -> bool {
    if !file_type.matches_name(filename) {
        return false;
    }
    if date_from.is_none() && date_to.is_none() {
        return true;
    }

    let Some(timestamp) = embedded_timestamp(filename) else {
        return false;
    };
    date_from.is_none_or(|from| timestamp >= from) && date_to.is_none_or(|to| timestamp <= to)
}

pub fn is_ok_file(filename: &str) -> bool {
    filename.len() > OK_SUFFIX.len() && filename.ends_with(OK_SUFFIX)
}

/// Data file paired with a control file, or `None` if `ok_filename` is not
/// a control file or the derived name is not of `file_type`
pub fn data_file_of_ok_file(file_type: &FileType, ok_filename: &str) -> Option<String> {
    if !is_ok_file(ok_filename) {
        return None;
    }
    let stem = &ok_filename[..ok_filename.len() - OK_SUFFIX.len()];

    let data_file = match file_type.data_naming {
        DataFileNaming::StripOkSuffix => stem.to_string(),
        DataFileNaming::ReplaceOkSuffix { ref extension } => {
            format!("{}.{}", stem, extension.trim_start_matches('.'))
        },
    };

    if data_file.is_empty() || !file_type.matches_name(&data_file) {
        return None;
    }
    Some(data_file)
}

/// Identity shared by every delivery of the same logical file: the type name
/// and the filename with its timestamp token removed
pub fn logical_key(file_type: &FileType, filename: &str) -> String {
    let base = filename.strip_suffix(OK_SUFFIX).unwrap_or(filename);
    format!("{}:{}", file_type.name, TIMESTAMP_TOKEN.replace(base, ""))
}
