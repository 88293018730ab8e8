//! Surgical updates of the shared AWS credentials file.
//!
//! The file is modelled as an ordered list of typed lines. Only the lines
//! holding the three managed keys of the targeted section are rewritten;
//! every other byte (comments, blank lines, unrelated sections and keys,
//! line endings) is carried through untouched. Writes go to a temporary
//! file in the same directory which then replaces the target.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::Token;
use crate::{
    constants,
    error::{Error, Result},
};

pub const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";
pub const SESSION_TOKEN: &str = "aws_session_token";

const MANAGED_KEYS: [&str; 3] = [ACCESS_KEY_ID, SECRET_ACCESS_KEY, SESSION_TOKEN];

/// The three managed values of one profile section as found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl StoredKeys {
    pub fn is_blank(&self) -> bool {
        self.access_key_id.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineKind {
    Blank,
    Comment,
    Section(String),
    KeyValue { key: String, value: String },
    Continuation,
}

#[derive(Debug, Clone)]
struct Line {
    text: String,
    ending: String,
    kind: LineKind,
}

#[derive(Debug, Clone, Copy)]
struct SectionSpan {
    header: usize,
    end: usize,
}

#[derive(Debug, Default)]
struct Document {
    lines: Vec<Line>,
    sections: HashMap<String, SectionSpan>,
}

impl Document {
    fn parse(content: &str, path: &Path) -> Result<Self> {
        let corrupt = |line: usize, reason: &str| Error::StoreCorrupt {
            path: path.to_path_buf(),
            line,
            reason: reason.to_string(),
        };

        let mut lines = Vec::new();
        let mut sections: HashMap<String, SectionSpan> = HashMap::new();
        let mut current: Option<String> = None;
        let mut in_value = false;

        for (index, raw) in content.split_inclusive('\n').enumerate() {
            let line_no = index + 1;
            let (text, ending) = split_ending(raw);
            let trimmed = text.trim();

            let kind = if trimmed.is_empty() {
                in_value = false;
                LineKind::Blank
            } else if trimmed.starts_with('#') || trimmed.starts_with(';') {
                LineKind::Comment
            } else if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| corrupt(line_no, "malformed section header"))?;

                if let Some(previous) = current.take() {
                    if let Some(span) = sections.get_mut(&previous) {
                        span.end = index;
                    }
                }
                if sections.contains_key(name) {
                    return Err(corrupt(line_no, &format!("duplicate section [{name}]")));
                }
                sections.insert(
                    name.to_string(),
                    SectionSpan {
                        header: index,
                        end: index + 1,
                    },
                );
                current = Some(name.to_string());
                in_value = false;
                LineKind::Section(name.to_string())
            } else if in_value && text.starts_with(char::is_whitespace) {
                LineKind::Continuation
            } else if let Some((key, value)) = text.split_once('=') {
                let key = key.trim();
                if key.is_empty() {
                    return Err(corrupt(line_no, "missing key before '='"));
                }
                if current.is_none() {
                    return Err(corrupt(line_no, "key outside of any section"));
                }
                in_value = true;
                LineKind::KeyValue {
                    key: key.to_string(),
                    value: value.trim().to_string(),
                }
            } else {
                return Err(corrupt(line_no, "expected `key = value`"));
            };

            lines.push(Line {
                text: text.to_string(),
                ending: ending.to_string(),
                kind,
            });
        }

        if let Some(span) = current.and_then(|name| sections.get_mut(&name)) {
            span.end = lines.len();
        }

        Ok(Self { lines, sections })
    }

    fn render(&self) -> String {
        self.lines
            .iter()
            .flat_map(|line| [line.text.as_str(), line.ending.as_str()])
            .collect()
    }

    fn read(&self, section: &str) -> Option<StoredKeys> {
        let span = self.sections.get(section)?;
        let mut keys = StoredKeys::default();

        for line in &self.lines[span.header + 1..span.end] {
            if let LineKind::KeyValue { key, value } = &line.kind {
                match key.as_str() {
                    ACCESS_KEY_ID => keys.access_key_id = value.clone(),
                    SECRET_ACCESS_KEY => keys.secret_access_key = value.clone(),
                    SESSION_TOKEN => keys.session_token = value.clone(),
                    _ => {}
                }
            }
        }
        Some(keys)
    }

    /// Rewrite the managed keys of `section`, creating the section when
    /// `create` is set. Returns false when the section is absent and not created.
    fn set(&mut self, section: &str, values: [(&str, &str); 3], create: bool) -> bool {
        let Some(span) = self.sections.get(section).copied() else {
            if create {
                self.append_section(section, values);
            }
            return create;
        };
        let span = self.drop_continuations(section, span);

        let ending = self.default_ending(span.header);
        let mut insert_at = span.header + 1;
        let mut missing = Vec::new();

        for (key, value) in values {
            let mut found = false;
            for index in span.header + 1..span.end {
                let line = &mut self.lines[index];
                match &line.kind {
                    LineKind::KeyValue { key: existing, .. } => {
                        if existing == key {
                            line.text = format_pair(key, value);
                            line.kind = LineKind::KeyValue {
                                key: key.to_string(),
                                value: value.to_string(),
                            };
                            found = true;
                        }
                        insert_at = insert_at.max(index + 1);
                    }
                    LineKind::Continuation => insert_at = insert_at.max(index + 1),
                    _ => {}
                }
            }
            if !found {
                missing.push((key, value));
            }
        }

        if missing.is_empty() {
            return true;
        }

        if let Some(previous) = self.lines.get_mut(insert_at - 1) {
            if previous.ending.is_empty() {
                previous.ending = ending.clone();
            }
        }
        let inserted: Vec<Line> = missing
            .into_iter()
            .map(|(key, value)| Line {
                text: format_pair(key, value),
                ending: ending.clone(),
                kind: LineKind::KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            })
            .collect();
        let count = inserted.len();
        self.lines.splice(insert_at..insert_at, inserted);

        for span in self.sections.values_mut() {
            if span.header >= insert_at {
                span.header += count;
            }
            if span.end >= insert_at {
                span.end += count;
            }
        }
        true
    }

    /// Remove the continuation lines of managed keys in the section, so a
    /// replaced value does not inherit the old value's tail.
    fn drop_continuations(&mut self, section: &str, span: SectionSpan) -> SectionSpan {
        let mut managed = false;
        let mut doomed = Vec::new();
        for index in span.header + 1..span.end {
            match &self.lines[index].kind {
                LineKind::KeyValue { key, .. } => managed = MANAGED_KEYS.contains(&key.as_str()),
                LineKind::Continuation if managed => doomed.push(index),
                _ => {}
            }
        }

        for &index in doomed.iter().rev() {
            self.lines.remove(index);
            for span in self.sections.values_mut() {
                if span.header > index {
                    span.header -= 1;
                }
                if span.end > index {
                    span.end -= 1;
                }
            }
        }

        self.sections.get(section).copied().unwrap_or(span)
    }

    fn append_section(&mut self, section: &str, values: [(&str, &str); 3]) {
        let ending = self
            .lines
            .first()
            .map(|line| line.ending.clone())
            .filter(|ending| !ending.is_empty())
            .unwrap_or_else(|| "\n".to_string());

        if let Some(last) = self.lines.last_mut() {
            if last.ending.is_empty() {
                last.ending = ending.clone();
            }
        }

        let header = self.lines.len();
        self.lines.push(Line {
            text: format!("[{section}]"),
            ending: ending.clone(),
            kind: LineKind::Section(section.to_string()),
        });
        for (key, value) in values {
            self.lines.push(Line {
                text: format_pair(key, value),
                ending: ending.clone(),
                kind: LineKind::KeyValue {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            });
        }
        self.sections.insert(
            section.to_string(),
            SectionSpan {
                header,
                end: self.lines.len(),
            },
        );
    }

    fn default_ending(&self, index: usize) -> String {
        self.lines
            .get(index)
            .map(|line| line.ending.clone())
            .filter(|ending| !ending.is_empty())
            .unwrap_or_else(|| "\n".to_string())
    }
}

fn split_ending(raw: &str) -> (&str, &str) {
    if let Some(text) = raw.strip_suffix("\r\n") {
        (text, "\r\n")
    } else if let Some(text) = raw.strip_suffix('\n') {
        (text, "\n")
    } else {
        (raw, "")
    }
}

fn format_pair(key: &str, value: &str) -> String {
    format!("{key} = {value}")
}

/// The shared credentials file (`~/.aws/credentials` by default)
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `AWS_SHARED_CREDENTIALS_FILE` or `~/.aws/credentials`
    pub fn from_env() -> anyhow::Result<Self> {
        let path = constants::get_aws_credentials_path()
            .context("Failed to determine AWS credentials path")?;
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the token's three keys into the profile's section.
    pub fn save(&self, profile: &str, token: &Token) -> Result<()> {
        let mut document = self.load_document()?.unwrap_or_default();
        document.set(
            profile,
            [
                (ACCESS_KEY_ID, token.access_key_id.as_str()),
                (SECRET_ACCESS_KEY, token.secret_access_key.as_str()),
                (SESSION_TOKEN, token.session_token.as_str()),
            ],
            true,
        );
        self.write_atomically(&document.render())?;

        info!(profile, path = %self.path.display(), "Saved temporary STS credentials");
        Ok(())
    }

    /// Blank the profile's three keys. A missing section or file is left alone.
    pub fn remove(&self, profile: &str) -> Result<()> {
        let Some(mut document) = self.load_document()? else {
            debug!(profile, "No credentials file, nothing to remove");
            return Ok(());
        };

        let blank = MANAGED_KEYS.map(|key| (key, ""));
        if !document.set(profile, blank, false) {
            debug!(profile, "No credentials section, nothing to remove");
            return Ok(());
        }
        self.write_atomically(&document.render())?;

        info!(profile, "Removed temporary STS credentials");
        Ok(())
    }

    /// Read the managed keys of a profile section, if the section exists.
    pub fn load(&self, profile: &str) -> Result<Option<StoredKeys>> {
        Ok(self
            .load_document()?
            .and_then(|document| document.read(profile)))
    }

    fn load_document(&self) -> Result<Option<Document>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content = String::from_utf8(bytes).map_err(|e| Error::StoreCorrupt {
            path: self.path.clone(),
            line: 0,
            reason: format!("not valid UTF-8: {e}"),
        })?;
        Document::parse(&content, &self.path).map(Some)
    }

    fn write_atomically(&self, content: &str) -> Result<()> {
        // Follow a symlinked credentials file instead of replacing the link
        let target = fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        let parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let mut temp = NamedTempFile::new_in(&parent)?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;

        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;

        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
