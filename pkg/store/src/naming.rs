use std::{cmp::Reverse, path::PathBuf, time::SystemTime};

use chrono::NaiveDate;

const DATE_FORMAT: &str = "%d-%m-%Y";
const DATE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    /// Every publish gets a new dated name; a bare `{legacy_stem}.ext` left by
    /// older installs is read when no dated current exists.
    Rotating {
        current_prefix: &'static str,
        backup_prefix: &'static str,
        legacy_stem: &'static str,
    },
    /// The current snapshot always has the same name.
    Fixed {
        stem: &'static str,
        backup_prefix: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Current,
    Backup,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotName {
    pub kind: SnapshotKind,
    pub date: Option<NaiveDate>,
    pub ordinal: u32,
}

/// A classified directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub file_name: String,
    pub modified: SystemTime,
    pub name: SnapshotName,
}

impl SnapshotFile {
    /// Ordering key for "most recent": modification time, then the date and
    /// ordinal encoded in the name for files touched within the same tick.
    pub fn recency(&self) -> (SystemTime, Option<NaiveDate>, u32) {
        (self.modified, self.name.date, self.name.ordinal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNamer {
    scheme: NamingScheme,
    extension: String,
}

impl SnapshotNamer {
    pub fn new(scheme: NamingScheme, extension: &str) -> Self {
        Self {
            scheme,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn scheme(&self) -> NamingScheme {
        self.scheme
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    fn backup_prefix(&self) -> &'static str {
        match self.scheme {
            NamingScheme::Rotating { backup_prefix, .. } | NamingScheme::Fixed { backup_prefix, .. } => {
                backup_prefix
            }
        }
    }

    pub fn current_name(&self, date: NaiveDate, ordinal: u32) -> String {
        match self.scheme {
            NamingScheme::Rotating { current_prefix, .. } => {
                dated_name(current_prefix, date, ordinal, &self.extension)
            }
            NamingScheme::Fixed { stem, .. } => format!("{stem}.{}", self.extension),
        }
    }

    pub fn backup_name(&self, date: NaiveDate, ordinal: u32) -> String {
        dated_name(self.backup_prefix(), date, ordinal, &self.extension)
    }

    pub fn legacy_name(&self) -> Option<String> {
        match self.scheme {
            NamingScheme::Rotating { legacy_stem, .. } => {
                Some(format!("{legacy_stem}.{}", self.extension))
            }
            NamingScheme::Fixed { .. } => None,
        }
    }

    /// Strict classification; anything that does not follow the grammar
    /// exactly is ignored. The backup grammar is tried first so a backup can
    /// never be taken for a current snapshot, whatever the prefixes are.
    pub fn classify(&self, file_name: &str) -> Option<SnapshotName> {
        let (stem, extension) = file_name.rsplit_once('.')?;
        if !extension.eq_ignore_ascii_case(&self.extension) {
            return None;
        }

        if let Some(rest) = stem.strip_prefix(self.backup_prefix())
            && let Some((date, ordinal)) = parse_dated(rest)
        {
            return Some(SnapshotName {
                kind: SnapshotKind::Backup,
                date: Some(date),
                ordinal,
            });
        }

        match self.scheme {
            NamingScheme::Rotating {
                current_prefix,
                legacy_stem,
                ..
            } => {
                if stem == legacy_stem {
                    return Some(SnapshotName {
                        kind: SnapshotKind::Legacy,
                        date: None,
                        ordinal: 1,
                    });
                }
                let (date, ordinal) = parse_dated(stem.strip_prefix(current_prefix)?)?;
                Some(SnapshotName {
                    kind: SnapshotKind::Current,
                    date: Some(date),
                    ordinal,
                })
            }
            NamingScheme::Fixed { stem: fixed, .. } => (stem == fixed).then_some(SnapshotName {
                kind: SnapshotKind::Current,
                date: None,
                ordinal: 1,
            }),
        }
    }

    pub fn is_backup(&self, file_name: &str) -> bool {
        matches!(
            self.classify(file_name),
            Some(SnapshotName {
                kind: SnapshotKind::Backup,
                ..
            })
        )
    }

    pub fn is_current(&self, file_name: &str) -> bool {
        !self.is_backup(file_name)
            && matches!(
                self.classify(file_name),
                Some(SnapshotName {
                    kind: SnapshotKind::Current,
                    ..
                })
            )
    }

    /// Most recent current snapshot, or the legacy file when none exists.
    pub fn select_current<'a>(&self, listing: &'a [SnapshotFile]) -> Option<&'a SnapshotFile> {
        newest(listing, SnapshotKind::Current).or_else(|| newest(listing, SnapshotKind::Legacy))
    }

    pub fn select_newest_backup<'a>(
        &self,
        listing: &'a [SnapshotFile],
    ) -> Option<&'a SnapshotFile> {
        newest(listing, SnapshotKind::Backup)
    }

    /// Backups sorted newest first.
    pub fn backups<'a>(&self, listing: &'a [SnapshotFile]) -> Vec<&'a SnapshotFile> {
        let mut backups: Vec<_> = listing
            .iter()
            .filter(|file| file.name.kind == SnapshotKind::Backup)
            .collect();
        backups.sort_by_key(|file| Reverse(file.recency()));
        backups
    }

    pub fn backups_to_prune<'a>(
        &self,
        listing: &'a [SnapshotFile],
        retention: usize,
    ) -> Vec<&'a SnapshotFile> {
        self.backups(listing).into_iter().skip(retention).collect()
    }

    /// One past the highest ordinal already used for `kind` on `date`.
    pub fn next_ordinal(&self, listing: &[SnapshotFile], kind: SnapshotKind, date: NaiveDate) -> u32 {
        listing
            .iter()
            .filter(|file| file.name.kind == kind && file.name.date == Some(date))
            .map(|file| file.name.ordinal)
            .max()
            .map_or(1, |ordinal| ordinal + 1)
    }
}

fn newest(listing: &[SnapshotFile], kind: SnapshotKind) -> Option<&SnapshotFile> {
    listing
        .iter()
        .filter(|file| file.name.kind == kind)
        .max_by_key(|file| file.recency())
}

fn dated_name(prefix: &str, date: NaiveDate, ordinal: u32, extension: &str) -> String {
    let date = date.format(DATE_FORMAT);
    if ordinal <= 1 {
        format!("{prefix}{date}.{extension}")
    } else {
        format!("{prefix}{date}_{ordinal}.{extension}")
    }
}

/// Parses `DD-MM-YYYY` optionally followed by `_N` with `N >= 2`.
fn parse_dated(raw: &str) -> Option<(NaiveDate, u32)> {
    if raw.len() < DATE_LEN || !raw.is_char_boundary(DATE_LEN) {
        return None;
    }
    let (date_part, suffix) = raw.split_at(DATE_LEN);
    let shape_ok = date_part.bytes().enumerate().all(|(index, byte)| match index {
        2 | 5 => byte == b'-',
        _ => byte.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }
    let date = NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()?;
    if suffix.is_empty() {
        return Some((date, 1));
    }
    let digits = suffix.strip_prefix('_')?;
    if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let ordinal: u32 = digits.parse().ok()?;
    (ordinal >= 2).then_some((date, ordinal))
}
