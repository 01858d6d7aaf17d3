//! Column mapping and the typed member record produced by validation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::IntakeError;

use super::format::RawRow;

/// A column the pipeline understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    IdNumber,
    FirstName,
    Surname,
    DateOfBirth,
    Gender,
    CellNumber,
    Email,
    WardCode,
    DateJoined,
    MembershipType,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::IdNumber,
        Field::FirstName,
        Field::Surname,
        Field::DateOfBirth,
        Field::Gender,
        Field::CellNumber,
        Field::Email,
        Field::WardCode,
        Field::DateJoined,
        Field::MembershipType,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::IdNumber => "id_number",
            Field::FirstName => "first_name",
            Field::Surname => "surname",
            Field::DateOfBirth => "date_of_birth",
            Field::Gender => "gender",
            Field::CellNumber => "cell_number",
            Field::Email => "email",
            Field::WardCode => "ward_code",
            Field::DateJoined => "date_joined",
            Field::MembershipType => "membership_type",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(
            self,
            Field::IdNumber
                | Field::FirstName
                | Field::Surname
                | Field::CellNumber
                | Field::WardCode
        )
    }

    /// Header spellings accepted for this field, in normalised form.
    fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::IdNumber => &[
                "idnumber",
                "id",
                "idno",
                "identitynumber",
                "identityno",
                "said",
                "nationalid",
            ],
            Field::FirstName => &["firstname", "firstnames", "name", "names", "givenname"],
            Field::Surname => &["surname", "lastname", "familyname"],
            Field::DateOfBirth => &["dateofbirth", "dob", "birthdate"],
            Field::Gender => &["gender", "sex"],
            Field::CellNumber => &[
                "cellnumber",
                "cell",
                "cellphone",
                "cellphonenumber",
                "mobile",
                "mobilenumber",
                "phone",
                "phonenumber",
            ],
            Field::Email => &["email", "emailaddress"],
            Field::WardCode => &["wardcode", "ward", "wardno", "wardnumber"],
            Field::DateJoined => &["datejoined", "joined", "joindate", "membershipdate"],
            Field::MembershipType => &["membershiptype", "type", "applicationtype"],
        }
    }

    pub fn from_header(header: &str) -> Option<Field> {
        let key = normalize_header(header);
        Field::ALL
            .into_iter()
            .find(|field| field.aliases().contains(&key.as_str()))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Maps each known field to its column position in the sheet.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    columns: HashMap<Field, usize>,
}

impl ColumnMap {
    /// Builds the map from a header row. The first matching column wins;
    /// unknown columns are ignored.
    pub fn from_headers(headers: &[String]) -> Result<Self, IntakeError> {
        let mut columns = HashMap::new();
        for (idx, header) in headers.iter().enumerate() {
            if let Some(field) = Field::from_header(header) {
                columns.entry(field).or_insert(idx);
            }
        }

        let missing: Vec<String> = Field::ALL
            .into_iter()
            .filter(|f| f.is_required() && !columns.contains_key(f))
            .map(|f| f.name().to_string())
            .collect();

        if !missing.is_empty() {
            return Err(IntakeError::MissingColumns(missing));
        }

        Ok(Self { columns })
    }

    pub fn index(&self, field: Field) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    pub fn extract(&self, row: &RawRow) -> RawRecord {
        let values = self
            .columns
            .iter()
            .filter_map(|(field, idx)| {
                row.cells
                    .get(*idx)
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(|v| (*field, v.to_string()))
            })
            .collect();

        RawRecord {
            line: row.line,
            values,
        }
    }
}

/// The mapped, still-untyped cells of one row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub line: usize,
    pub values: BTreeMap<Field, String>,
}

impl RawRecord {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "m" | "male" => Some(Gender::Male),
            "f" | "female" => Some(Gender::Female),
            "o" | "other" => Some(Gender::Other),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipType {
    #[default]
    New,
    Renewal,
}

impl MembershipType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" | "n" | "application" => Some(MembershipType::New),
            "renewal" | "renew" | "r" => Some(MembershipType::Renewal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MembershipType::New => "new",
            MembershipType::Renewal => "renewal",
        }
    }
}

/// A row that passed validation, with every field normalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id_number: String,
    pub first_name: String,
    pub surname: String,
    pub date_of_birth: NaiveDate,
    pub gender: Option<Gender>,
    /// E.164, `+27XXXXXXXXX`.
    pub cell_number: String,
    pub email: Option<String>,
    pub ward_code: String,
    pub date_joined: NaiveDate,
    pub membership_type: MembershipType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_header_aliases() {
        assert_eq!(Field::from_header("ID Number"), Some(Field::IdNumber));
        assert_eq!(Field::from_header("id_no"), Some(Field::IdNumber));
        assert_eq!(Field::from_header("Cell-Phone"), Some(Field::CellNumber));
        assert_eq!(Field::from_header("MOBILE"), Some(Field::CellNumber));
        assert_eq!(Field::from_header("Ward"), Some(Field::WardCode));
        assert_eq!(Field::from_header("branch"), None);
    }

    #[test]
    fn test_column_map_first_match_wins() {
        let map = ColumnMap::from_headers(&headers(&[
            "ID Number",
            "First Name",
            "Surname",
            "Cell",
            "Ward Code",
            "Phone",
        ]))
        .unwrap();
        assert_eq!(map.index(Field::CellNumber), Some(3));
        assert_eq!(map.index(Field::Email), None);
    }

    #[test]
    fn test_column_map_reports_missing_required() {
        let err = ColumnMap::from_headers(&headers(&["first_name", "surname", "email"]))
            .unwrap_err();
        match err {
            IntakeError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["id_number", "cell_number", "ward_code"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_extract_skips_empty_cells() {
        let map = ColumnMap::from_headers(&headers(&[
            "id_number",
            "first_name",
            "surname",
            "cell_number",
            "ward_code",
            "email",
        ]))
        .unwrap();
        let row = RawRow {
            line: 7,
            cells: headers(&["8001015009087", " Thandi ", "Mokoena", "082 123 4567", "79700001", ""]),
        };
        let raw = map.extract(&row);
        assert_eq!(raw.line, 7);
        assert_eq!(raw.get(Field::FirstName), Some("Thandi"));
        assert_eq!(raw.get(Field::Email), None);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(Gender::parse("F"), Some(Gender::Female));
        assert_eq!(Gender::parse("x"), None);
        assert_eq!(MembershipType::parse("Renewal"), Some(MembershipType::Renewal));
        assert_eq!(MembershipType::default(), MembershipType::New);
    }
}
