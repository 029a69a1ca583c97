use std::fmt;

use regex::Regex;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, MapAccess, Visitor},
    ser::SerializeMap,
};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A single spreadsheet cell. Records never nest.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FieldValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
}

impl FieldValue {
    /// Builds a text value, folding blank input into `Empty`.
    pub fn text(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(raw)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(raw) => raw.trim().is_empty(),
            Self::Number(_) => false,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(raw) => raw.trim().to_string(),
            Self::Number(value) => format_number(*value),
        }
    }

    /// Numeric view of the cell. Text cells accept a decimal comma.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Empty => None,
            Self::Number(value) => value.is_finite().then_some(*value),
            Self::Text(raw) => raw
                .trim()
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite()),
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        let value = self.as_f64()?;
        if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
            return None;
        }
        Some(value as u32)
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Empty)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => serializer.serialize_none(),
            Self::Text(raw) => serializer.serialize_str(raw),
            Self::Number(value) => serializer.serialize_f64(*value),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldValueVisitor;

        impl<'de> Visitor<'de> for FieldValueVisitor {
            type Value = FieldValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("null, a string, a number or a boolean")
            }

            fn visit_unit<E: de::Error>(self) -> Result<FieldValue, E> {
                Ok(FieldValue::Empty)
            }

            fn visit_none<E: de::Error>(self) -> Result<FieldValue, E> {
                Ok(FieldValue::Empty)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<FieldValue, D::Error> {
                FieldValue::deserialize(d)
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<FieldValue, E> {
                Ok(FieldValue::Text(value.to_string()))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<FieldValue, E> {
                Ok(FieldValue::Number(value as f64))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<FieldValue, E> {
                Ok(FieldValue::Number(value as f64))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<FieldValue, E> {
                Ok(FieldValue::Number(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<FieldValue, E> {
                Ok(FieldValue::text(value))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<FieldValue, E> {
                Ok(FieldValue::text(value))
            }
        }

        deserializer.deserialize_any(FieldValueVisitor)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Ordered, flat mapping from field name to cell value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Replaces the value of an identically named field or appends a new one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let index = self.fields.iter().position(|(existing, _)| existing == name)?;
        Some(self.fields.remove(index).1)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    /// Lenient lookup used against hand-edited spreadsheets: see [`match_column`].
    pub fn lookup(&self, expected: &str) -> Option<&FieldValue> {
        let names: Vec<&str> = self.field_names().collect();
        match_column(&names, expected).map(|index| &self.fields[index].1)
    }

    pub fn text(&self, expected: &str) -> String {
        self.lookup(expected)
            .map(FieldValue::as_text)
            .unwrap_or_default()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when every value is empty (spreadsheet filler rows).
    pub fn is_blank(&self) -> bool {
        self.fields.iter().all(|(_, value)| value.is_empty())
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a flat object of scalar fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Record, A::Error> {
                let mut record = Record::new();
                while let Some((name, value)) = access.next_entry::<String, FieldValue>()? {
                    record.insert(name, value);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

// ---------------------------------------------------------------------------
// Header matching
// ---------------------------------------------------------------------------

const MIN_PARTIAL_MATCH_LEN: usize = 3;

pub fn normalize_field_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn names_equal(a: &str, b: &str) -> bool {
    normalize_field_name(a) == normalize_field_name(b)
}

fn partial_match(header: &str, expected: &str) -> bool {
    header.chars().count() >= MIN_PARTIAL_MATCH_LEN
        && expected.chars().count() >= MIN_PARTIAL_MATCH_LEN
        && (header.contains(expected) || expected.contains(header))
}

/// Finds the header that answers to `expected`: an exact normalized match wins,
/// otherwise the first header that contains or is contained in the name.
pub fn match_column<S: AsRef<str>>(headers: &[S], expected: &str) -> Option<usize> {
    let expected = normalize_field_name(expected);
    if expected.is_empty() {
        return None;
    }
    let normalized: Vec<String> = headers
        .iter()
        .map(|header| normalize_field_name(header.as_ref()))
        .collect();
    normalized
        .iter()
        .position(|header| *header == expected)
        .or_else(|| {
            normalized
                .iter()
                .position(|header| partial_match(header, &expected))
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnBinding {
    pub expected: String,
    pub header: Option<String>,
}

/// One-to-one assignment of expected column names to the headers of a sheet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMap {
    bindings: Vec<ColumnBinding>,
}

impl ColumnMap {
    /// Exact matches are claimed before any partial match so that `cto` binds
    /// to a `cto` column even when `id_cto` appears first.
    pub fn resolve<S: AsRef<str>>(headers: &[S], expected: &[&str]) -> Self {
        let normalized: Vec<String> = headers
            .iter()
            .map(|header| normalize_field_name(header.as_ref()))
            .collect();
        let mut claimed = vec![false; headers.len()];
        let mut slots: Vec<Option<usize>> = vec![None; expected.len()];

        for (slot, name) in expected.iter().enumerate() {
            let name = normalize_field_name(name);
            if let Some(index) =
                (0..normalized.len()).find(|&index| !claimed[index] && normalized[index] == name)
            {
                claimed[index] = true;
                slots[slot] = Some(index);
            }
        }
        for (slot, name) in expected.iter().enumerate() {
            if slots[slot].is_some() {
                continue;
            }
            let name = normalize_field_name(name);
            if let Some(index) = (0..normalized.len())
                .find(|&index| !claimed[index] && partial_match(&normalized[index], &name))
            {
                claimed[index] = true;
                slots[slot] = Some(index);
            }
        }

        let bindings = expected
            .iter()
            .zip(slots)
            .map(|(name, slot)| ColumnBinding {
                expected: (*name).to_string(),
                header: slot.map(|index| headers[index].as_ref().to_string()),
            })
            .collect();
        Self { bindings }
    }

    pub fn bindings(&self) -> &[ColumnBinding] {
        &self.bindings
    }

    pub fn header_for(&self, expected: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|binding| binding.expected == expected)
            .and_then(|binding| binding.header.as_deref())
    }

    pub fn missing(&self) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|binding| binding.header.is_none())
            .map(|binding| binding.expected.clone())
            .collect()
    }

    /// Rewrites a row under the canonical column names, in canonical order.
    pub fn project(&self, record: &Record) -> Record {
        self.bindings
            .iter()
            .map(|binding| {
                let value = binding
                    .header
                    .as_deref()
                    .and_then(|header| record.get(header))
                    .cloned()
                    .unwrap_or_default();
                (binding.expected.clone(), value)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Dataset column contracts
// ---------------------------------------------------------------------------

pub const ROSTER_COLUMNS: [&str; 2] = ["nome", "senha"];
pub const TAG_COLUMNS: [&str; 1] = ["tabulacao"];

/// On-disk ledger header. External tooling reads these names verbatim.
pub const LEDGER_COLUMNS: [&str; 8] = [
    "VI ALA",
    "ALA",
    "DATA",
    "PROJETISTA",
    "CIDADE",
    "ENDEREÇO",
    "LATITUDE",
    "LONGITUDE",
];

pub const CTO_COLUMNS: [&str; 16] = [
    "cid_rede",
    "estado",
    "pop",
    "olt",
    "slot",
    "pon",
    "id_cto",
    "cto",
    "latitude",
    "longitude",
    "status_cto",
    "data_cadastro",
    "portas",
    "ocupado",
    "livre",
    "pct_ocup",
];

pub const CTO_CRITICAL_COLUMNS: [&str; 2] = ["latitude", "longitude"];

// ---------------------------------------------------------------------------
// Typed dataset entries
// ---------------------------------------------------------------------------

/// Roster member. `secret` is `None` for rows migrated from the bare-name
/// roster format, which predates per-designer passwords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesignerEntry {
    pub name: String,
    pub secret: Option<String>,
}

impl DesignerEntry {
    pub fn from_record(record: &Record) -> Option<Self> {
        let name = match record.lookup(ROSTER_COLUMNS[0]) {
            Some(value) => value.as_text(),
            None => first_non_empty(record)?,
        };
        if name.is_empty() {
            return None;
        }
        let secret = record
            .lookup(ROSTER_COLUMNS[1])
            .map(FieldValue::as_text)
            .filter(|secret| !secret.is_empty());
        Some(Self { name, secret })
    }

    /// Rows without a secret column come from the legacy bare-name roster.
    pub fn is_legacy_record(record: &Record) -> bool {
        record.lookup(ROSTER_COLUMNS[1]).is_none()
    }

    pub fn to_record(&self) -> Record {
        Record::new()
            .with(ROSTER_COLUMNS[0], self.name.as_str())
            .with(ROSTER_COLUMNS[1], self.secret.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeTag {
    pub name: String,
}

impl OutcomeTag {
    pub fn from_record(record: &Record) -> Option<Self> {
        let name = match record.lookup(TAG_COLUMNS[0]) {
            Some(value) => value.as_text(),
            None => first_non_empty(record)?,
        };
        (!name.is_empty()).then_some(Self { name })
    }

    pub fn to_record(&self) -> Record {
        Record::new().with(TAG_COLUMNS[0], self.name.as_str())
    }
}

fn first_non_empty(record: &Record) -> Option<String> {
    record
        .iter()
        .map(|(_, value)| value.as_text())
        .find(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEntry {
    pub ticket_id: String,
    pub sub_area: String,
    pub date: String,
    pub operator: String,
    pub city: String,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TicketEntry {
    pub fn from_record(record: &Record) -> Self {
        Self {
            ticket_id: record.text(LEDGER_COLUMNS[0]),
            sub_area: record.text(LEDGER_COLUMNS[1]),
            date: record.text(LEDGER_COLUMNS[2]),
            operator: record.text(LEDGER_COLUMNS[3]),
            city: record.text(LEDGER_COLUMNS[4]),
            address: record.text(LEDGER_COLUMNS[5]),
            latitude: record.lookup(LEDGER_COLUMNS[6]).and_then(FieldValue::as_f64),
            longitude: record.lookup(LEDGER_COLUMNS[7]).and_then(FieldValue::as_f64),
        }
    }

    pub fn to_record(&self) -> Record {
        Record::new()
            .with(LEDGER_COLUMNS[0], self.ticket_id.as_str())
            .with(LEDGER_COLUMNS[1], self.sub_area.as_str())
            .with(LEDGER_COLUMNS[2], self.date.as_str())
            .with(LEDGER_COLUMNS[3], self.operator.as_str())
            .with(LEDGER_COLUMNS[4], self.city.as_str())
            .with(LEDGER_COLUMNS[5], self.address.as_str())
            .with(LEDGER_COLUMNS[6], self.latitude)
            .with(LEDGER_COLUMNS[7], self.longitude)
    }
}

/// One optical distribution point from the CTO master list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CtoEntry {
    pub network_id: String,
    pub state: String,
    pub pop: String,
    pub olt: String,
    pub slot: String,
    pub pon: String,
    pub cto_id: String,
    pub cto_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: String,
    pub registration_date: String,
    pub ports: Option<u32>,
    pub used: Option<u32>,
    pub free: Option<u32>,
    pub occupancy_pct: Option<f64>,
}

impl CtoEntry {
    pub fn from_record(record: &Record) -> Self {
        let number = |column: &str| record.lookup(column).and_then(FieldValue::as_f64);
        let count = |column: &str| record.lookup(column).and_then(FieldValue::as_u32);
        Self {
            network_id: record.text("cid_rede"),
            state: record.text("estado"),
            pop: record.text("pop"),
            olt: record.text("olt"),
            slot: record.text("slot"),
            pon: record.text("pon"),
            cto_id: record.text("id_cto"),
            cto_name: record.text("cto"),
            latitude: number("latitude"),
            longitude: number("longitude"),
            status: record.text("status_cto"),
            registration_date: record.text("data_cadastro"),
            ports: count("portas"),
            used: count("ocupado"),
            free: count("livre"),
            occupancy_pct: number("pct_ocup"),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let latitude = self.latitude.filter(|value| (-90.0..=90.0).contains(value))?;
        let longitude = self
            .longitude
            .filter(|value| (-180.0..=180.0).contains(value))?;
        Some((latitude, longitude))
    }
}

// ---------------------------------------------------------------------------
// Ticket identifiers
// ---------------------------------------------------------------------------

pub const DEFAULT_TICKET_PREFIX: &str = "VI ALA";
pub const TICKET_SEQUENCE_WIDTH: usize = 7;

pub fn format_ticket_id(prefix: &str, sequence: u64) -> String {
    format!("{prefix}-{sequence:0width$}", width = TICKET_SEQUENCE_WIDTH)
}

/// Parser for `PREFIX-NNNNNNN` ids. Older rows may miss the hyphen or carry
/// extra spaces between prefix and digits.
#[derive(Debug, Clone)]
pub struct TicketIdPattern {
    prefix: String,
    regex: Regex,
}

impl TicketIdPattern {
    pub fn new(prefix: &str) -> Result<Self, ValidationError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(ValidationError::MissingField("ticket_prefix"));
        }
        let regex = Regex::new(&format!(r"(?i)^{}[-\s]*(\d+)", regex::escape(prefix)))
            .map_err(|err| ValidationError::InvalidTicketId(err.to_string()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            regex,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn parse_sequence(&self, raw: &str) -> Option<u64> {
        let captures = self.regex.captures(raw.trim())?;
        captures.get(1)?.as_str().parse().ok()
    }

    pub fn format(&self, sequence: u64) -> String {
        format_ticket_id(&self.prefix, sequence)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("value out of range: {0}")]
    InvalidRange(&'static str),
    #[error("invalid ticket id: {0}")]
    InvalidTicketId(String),
    #[error(
        "missing critical columns: {} (found: {})",
        .missing.join(", "),
        .found.join(", ")
    )]
    MissingCriticalColumns {
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error("file could not be read as a spreadsheet: {0}")]
    Unreadable(String),
    #[error("upload contains no data rows")]
    EmptyUpload,
}

/// Trims a required text field, rejecting blank input.
pub fn validate_name(field: &'static str, raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

pub fn validate_ticket(ticket: &TicketEntry) -> Result<(), ValidationError> {
    if ticket.operator.trim().is_empty() {
        return Err(ValidationError::MissingField("operator"));
    }
    if let Some(latitude) = ticket.latitude
        && !(-90.0..=90.0).contains(&latitude)
    {
        return Err(ValidationError::InvalidRange("latitude"));
    }
    if let Some(longitude) = ticket.longitude
        && !(-180.0..=180.0).contains(&longitude)
    {
        return Err(ValidationError::InvalidRange("longitude"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str) -> TicketEntry {
        TicketEntry {
            ticket_id: id.to_string(),
            sub_area: "ALA 3".to_string(),
            date: "19/10/2026".to_string(),
            operator: "Ana".to_string(),
            city: "Campinas".to_string(),
            address: "Rua A, 10".to_string(),
            latitude: Some(-22.9),
            longitude: Some(-47.06),
        }
    }

    #[test]
    fn number_cells_render_without_zero_fraction() {
        assert_eq!(FieldValue::Number(7.0).as_text(), "7");
        assert_eq!(FieldValue::Number(-23.55).as_text(), "-23.55");
        assert_eq!(FieldValue::text("  "), FieldValue::Empty);
    }

    #[test]
    fn text_cells_parse_decimal_comma() {
        assert_eq!(FieldValue::text("-23,5").as_f64(), Some(-23.5));
        assert_eq!(FieldValue::text("n/a").as_f64(), None);
        assert_eq!(FieldValue::text("16").as_u32(), Some(16));
        assert_eq!(FieldValue::Number(1.5).as_u32(), None);
    }

    #[test]
    fn lookup_prefers_exact_match_over_partial() {
        let record = Record::new()
            .with("ID_CTO", "CTO-77")
            .with(" Cto ", "Box 77");
        assert_eq!(record.text("cto"), "Box 77");
        assert_eq!(record.text("id_cto"), "CTO-77");
    }

    #[test]
    fn lookup_tolerates_header_drift() {
        let record = Record::new().with("Latitude (graus)", -22.9).with("lng", 1.0);
        assert_eq!(record.lookup("latitude").and_then(FieldValue::as_f64), Some(-22.9));
        assert!(record.lookup("longitude").is_none());
    }

    #[test]
    fn column_map_claims_exact_headers_before_partial_ones() {
        let headers = ["id_cto", "cto", "LATITUDE", "Longitude"];
        let map = ColumnMap::resolve(&headers, &["cto", "id_cto", "latitude", "longitude", "pop"]);
        assert_eq!(map.header_for("cto"), Some("cto"));
        assert_eq!(map.header_for("id_cto"), Some("id_cto"));
        assert_eq!(map.header_for("latitude"), Some("LATITUDE"));
        assert_eq!(map.missing(), vec!["pop".to_string()]);
    }

    #[test]
    fn column_map_projects_rows_onto_canonical_names() {
        let headers = ["Estado", "LAT", "LONG"];
        let map = ColumnMap::resolve(&headers, &["estado", "latitude", "longitude"]);
        let row = Record::new()
            .with("Estado", "SP")
            .with("LAT", -22.9)
            .with("LONG", -47.0);
        let projected = map.project(&row);
        let names: Vec<&str> = projected.field_names().collect();
        assert_eq!(names, vec!["estado", "latitude", "longitude"]);
        assert_eq!(projected.get("latitude"), Some(&FieldValue::Number(-22.9)));
    }

    #[test]
    fn ticket_pattern_accepts_legacy_spacing() {
        let pattern = TicketIdPattern::new(DEFAULT_TICKET_PREFIX).unwrap();
        assert_eq!(pattern.parse_sequence("VI ALA-0000007"), Some(7));
        assert_eq!(pattern.parse_sequence("VI ALA 12"), Some(12));
        assert_eq!(pattern.parse_sequence("VI ALA - 0000031"), Some(31));
        assert_eq!(pattern.parse_sequence("OUTRO-0000001"), None);
        assert_eq!(pattern.parse_sequence("VI ALA-"), None);
        assert_eq!(pattern.format(8), "VI ALA-0000008");
    }

    #[test]
    fn ticket_pattern_rejects_blank_prefix() {
        assert_eq!(
            TicketIdPattern::new("  ").unwrap_err(),
            ValidationError::MissingField("ticket_prefix")
        );
    }

    #[test]
    fn designer_entry_migrates_bare_name_rows() {
        let legacy = Record::new().with("PROJETISTA", "Carla");
        assert!(DesignerEntry::is_legacy_record(&legacy));
        let entry = DesignerEntry::from_record(&legacy).unwrap();
        assert_eq!(entry.name, "Carla");
        assert_eq!(entry.secret, None);

        let current = Record::new().with("nome", "Ana").with("senha", "x");
        assert!(!DesignerEntry::is_legacy_record(&current));
        assert_eq!(
            DesignerEntry::from_record(&current).unwrap().secret.as_deref(),
            Some("x")
        );
    }

    #[test]
    fn ledger_record_uses_on_disk_header() {
        let record = ticket("VI ALA-0000001").to_record();
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, LEDGER_COLUMNS.to_vec());
        assert_eq!(TicketEntry::from_record(&record), ticket("VI ALA-0000001"));
    }

    #[test]
    fn record_json_keeps_field_order_and_nulls() {
        let record = Record::new()
            .with("nome", "Ana")
            .with("senha", FieldValue::Empty)
            .with("portas", 16.0);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"nome":"Ana","senha":null,"portas":16.0}"#);
        let parsed: Record = serde_json::from_str(r#"{"ativo":true,"n":3}"#).unwrap();
        assert_eq!(parsed.get("ativo"), Some(&FieldValue::Text("true".into())));
        assert_eq!(parsed.get("n"), Some(&FieldValue::Number(3.0)));
    }

    #[test]
    fn rejects_ticket_with_out_of_range_latitude() {
        let mut entry = ticket("VI ALA-0000001");
        entry.latitude = Some(123.0);
        assert_eq!(
            validate_ticket(&entry),
            Err(ValidationError::InvalidRange("latitude"))
        );
    }

    #[test]
    fn cto_coordinates_require_valid_ranges() {
        let row = Record::new()
            .with("latitude", "-22,91")
            .with("longitude", -47.06)
            .with("portas", 16.0);
        let entry = CtoEntry::from_record(&row);
        assert_eq!(entry.coordinates(), Some((-22.91, -47.06)));
        assert_eq!(entry.ports, Some(16));

        let broken = CtoEntry::from_record(&Record::new().with("latitude", 95.0).with("longitude", 1.0));
        assert_eq!(broken.coordinates(), None);
    }
}
