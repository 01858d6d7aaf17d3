//! Per-row validation and intra-file duplicate detection.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::IntakeConfig;

use super::format::Table;
use super::record::{ColumnMap, Field, Gender, MemberRecord, MembershipType, RawRecord};

static RE_EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s.]+(\.[^@\s.]+)+$").unwrap());
static RE_PHONE_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\-()]").unwrap());

const MAX_NAME_LEN: usize = 100;
const WARD_CODE_LEN: usize = 8;
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

/// Why a single row was rejected. Never aborts the job.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RowValidationError {
    #[error("missing required field {field}")]
    MissingField { field: Field },

    #[error("malformed {field}: {reason}")]
    MalformedIdentifier { field: Field, reason: String },

    #[error("id_number checksum mismatch")]
    ChecksumMismatch,

    #[error("{field} out of range: {reason}")]
    OutOfRange { field: Field, reason: String },

    #[error("malformed cell_number")]
    MalformedPhone,

    #[error("malformed {field}: expected YYYY-MM-DD, YYYY/MM/DD or DD/MM/YYYY")]
    MalformedDate { field: Field },

    #[error("malformed email address")]
    MalformedEmail,

    #[error("{field} longer than {max} characters")]
    TooLong { field: Field, max: usize },

    #[error("inconsistent data: {reason}")]
    Inconsistent { reason: String },
}

impl RowValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            RowValidationError::MissingField { .. } => "missing_field",
            RowValidationError::MalformedIdentifier { .. } => "malformed_identifier",
            RowValidationError::ChecksumMismatch => "checksum_mismatch",
            RowValidationError::OutOfRange { .. } => "out_of_range",
            RowValidationError::MalformedPhone => "malformed_phone",
            RowValidationError::MalformedDate { .. } => "malformed_date",
            RowValidationError::MalformedEmail => "malformed_email",
            RowValidationError::TooLong { .. } => "too_long",
            RowValidationError::Inconsistent { .. } => "inconsistent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid(MemberRecord),
    Invalid(RowValidationError),
    /// A later occurrence of a natural key already seen on `first_line`.
    Duplicate { first_line: usize },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedRow {
    /// 0-based position among the data rows.
    pub index: usize,
    pub raw: RawRecord,
    pub result: ValidationResult,
}

impl ValidatedRow {
    pub fn line(&self) -> usize {
        self.raw.line
    }
}

pub struct RowValidator {
    min_age: u32,
    max_age: u32,
    today: NaiveDate,
}

impl RowValidator {
    pub fn new(limits: &IntakeConfig, today: NaiveDate) -> Self {
        Self {
            min_age: limits.min_age,
            max_age: limits.max_age,
            today,
        }
    }

    /// Validates every data row in file order. The first valid occurrence of
    /// an id_number is kept; later valid occurrences become duplicates.
    pub fn validate_all(&self, table: &Table, columns: &ColumnMap) -> Vec<ValidatedRow> {
        let mut seen: HashMap<String, usize> = HashMap::new();

        table
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let raw = columns.extract(row);
                let result = match self.validate(&raw) {
                    Ok(record) => match seen.get(&record.id_number) {
                        Some(first_line) => ValidationResult::Duplicate {
                            first_line: *first_line,
                        },
                        None => {
                            seen.insert(record.id_number.clone(), raw.line);
                            ValidationResult::Valid(record)
                        }
                    },
                    Err(e) => ValidationResult::Invalid(e),
                };
                ValidatedRow { index, raw, result }
            })
            .collect()
    }

    pub fn validate(&self, raw: &RawRecord) -> Result<MemberRecord, RowValidationError> {
        for field in Field::ALL {
            if field.is_required() && raw.get(field).is_none() {
                return Err(RowValidationError::MissingField { field });
            }
        }

        let id_raw = required(raw, Field::IdNumber)?;
        let supplied_dob = raw
            .get(Field::DateOfBirth)
            .map(|v| {
                parse_date(v).ok_or(RowValidationError::MalformedDate {
                    field: Field::DateOfBirth,
                })
            })
            .transpose()?;
        let (id_number, date_of_birth) = self.validate_id(id_raw, supplied_dob)?;

        let age = age_on(date_of_birth, self.today);
        if age < self.min_age as i32 || age > self.max_age as i32 {
            return Err(RowValidationError::OutOfRange {
                field: Field::IdNumber,
                reason: format!(
                    "age {} outside {}..={}",
                    age, self.min_age, self.max_age
                ),
            });
        }

        let first_name = validate_name(raw, Field::FirstName)?;
        let surname = validate_name(raw, Field::Surname)?;
        let cell_number = normalize_phone(required(raw, Field::CellNumber)?)
            .ok_or(RowValidationError::MalformedPhone)?;
        let ward_code = validate_ward(required(raw, Field::WardCode)?)?;

        let email = match raw.get(Field::Email) {
            Some(value) if RE_EMAIL.is_match(value) => Some(value.to_ascii_lowercase()),
            Some(_) => return Err(RowValidationError::MalformedEmail),
            None => None,
        };

        let gender = raw
            .get(Field::Gender)
            .map(|v| {
                Gender::parse(v).ok_or_else(|| RowValidationError::OutOfRange {
                    field: Field::Gender,
                    reason: "expected M, F or O".to_string(),
                })
            })
            .transpose()?;

        let date_joined = match raw.get(Field::DateJoined) {
            Some(value) => parse_date(value).ok_or(RowValidationError::MalformedDate {
                field: Field::DateJoined,
            })?,
            None => self.today,
        };
        if date_joined > self.today {
            return Err(RowValidationError::OutOfRange {
                field: Field::DateJoined,
                reason: "date is in the future".to_string(),
            });
        }
        if date_joined < date_of_birth {
            return Err(RowValidationError::Inconsistent {
                reason: "date_joined is before date_of_birth".to_string(),
            });
        }

        let membership_type = raw
            .get(Field::MembershipType)
            .map(|v| {
                MembershipType::parse(v).ok_or_else(|| RowValidationError::OutOfRange {
                    field: Field::MembershipType,
                    reason: "expected new or renewal".to_string(),
                })
            })
            .transpose()?
            .unwrap_or_default();

        Ok(MemberRecord {
            id_number,
            first_name,
            surname,
            date_of_birth,
            gender,
            cell_number,
            email,
            ward_code,
            date_joined,
            membership_type,
        })
    }

    /// Structure, birth date, citizenship digit and checksum of a 13-digit
    /// national identifier. Returns the cleaned id and its birth date.
    fn validate_id(
        &self,
        value: &str,
        supplied_dob: Option<NaiveDate>,
    ) -> Result<(String, NaiveDate), RowValidationError> {
        let malformed = |reason: &str| RowValidationError::MalformedIdentifier {
            field: Field::IdNumber,
            reason: reason.to_string(),
        };

        let id: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        if id.len() != 13 || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("expected 13 digits"));
        }

        let digits: Vec<u32> = id.bytes().map(|b| (b - b'0') as u32).collect();
        let yy = (digits[0] * 10 + digits[1]) as i32;
        let month = digits[2] * 10 + digits[3];
        let day = digits[4] * 10 + digits[5];

        let century = if yy <= self.today.year() % 100 { 2000 } else { 1900 };
        let mut dob = NaiveDate::from_ymd_opt(century + yy, month, day)
            .ok_or_else(|| malformed("invalid birth date"))?;

        if digits[10] > 2 {
            return Err(malformed("invalid citizenship digit"));
        }

        if luhn_check_digit(&id[..12]) != Some(digits[12] as u8) {
            return Err(RowValidationError::ChecksumMismatch);
        }

        if let Some(supplied) = supplied_dob {
            let same_day = supplied.month() == month && supplied.day() == day;
            if !same_day || supplied.year().rem_euclid(100) != yy {
                return Err(RowValidationError::Inconsistent {
                    reason: "date_of_birth does not match id_number".to_string(),
                });
            }
            // The full year disambiguates the century.
            dob = supplied;
        }

        Ok((id, dob))
    }
}

/// Luhn check digit for a string of decimal digits.
pub fn luhn_check_digit(payload: &str) -> Option<u8> {
    let mut sum = 0u32;
    for (i, c) in payload.chars().rev().enumerate() {
        let d = c.to_digit(10)?;
        sum += if i % 2 == 0 {
            let doubled = d * 2;
            if doubled > 9 {
                doubled - 9
            } else {
                doubled
            }
        } else {
            d
        };
    }
    Some(((10 - sum % 10) % 10) as u8)
}

fn required(raw: &RawRecord, field: Field) -> Result<&str, RowValidationError> {
    raw.get(field)
        .ok_or(RowValidationError::MissingField { field })
}

fn validate_name(raw: &RawRecord, field: Field) -> Result<String, RowValidationError> {
    let name = required(raw, field)?.trim();
    if name.chars().count() > MAX_NAME_LEN {
        return Err(RowValidationError::TooLong {
            field,
            max: MAX_NAME_LEN,
        });
    }
    Ok(name.to_string())
}

fn validate_ward(value: &str) -> Result<String, RowValidationError> {
    let ward = value.trim();
    if ward.len() != WARD_CODE_LEN || !ward.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RowValidationError::MalformedIdentifier {
            field: Field::WardCode,
            reason: format!("expected {} digits", WARD_CODE_LEN),
        });
    }
    Ok(ward.to_string())
}

/// Normalises a South African mobile number to `+27XXXXXXXXX`.
fn normalize_phone(value: &str) -> Option<String> {
    let cleaned = RE_PHONE_SEPARATORS.replace_all(value, "");
    let national = if let Some(rest) = cleaned.strip_prefix("+27") {
        rest
    } else if let Some(rest) = cleaned.strip_prefix("27").filter(|r| r.len() == 9) {
        rest
    } else if let Some(rest) = cleaned.strip_prefix('0') {
        rest
    } else {
        // Numeric spreadsheet cells lose the leading zero.
        &cleaned[..]
    };

    let valid = national.len() == 9
        && national.bytes().all(|b| b.is_ascii_digit())
        && matches!(national.as_bytes()[0], b'6' | b'7' | b'8');
    valid.then(|| format!("+27{}", national))
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .or_else(|| excel_serial_date(value))
}

/// XLSX stores dates as days since 1899-12-30.
fn excel_serial_date(value: &str) -> Option<NaiveDate> {
    let serial: i64 = value.parse().ok()?;
    if !(1..=2_958_465).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial))
}

fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}
