//! Quote and lead requests: service quotes, wheel-spec quotes and wholesale
//! applications.
//!
//! [`NewQuoteRequest`] is the submitted form. It deserializes with
//! `deny_unknown_fields` and is turned into a [`QuoteRequest`] only through
//! [`NewQuoteRequest::validate`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::email::{Email, EmailError};
use super::id::QuoteRequestId;
use super::status::QuoteStatus;

/// Maximum number of request lines.
pub const MAX_LINES: usize = 50;
/// Maximum characters in a line description.
pub const MAX_DESCRIPTION_CHARS: usize = 500;
/// Maximum quantity per line.
pub const MAX_QUANTITY: u32 = 999;
/// Maximum characters in the notes field.
pub const MAX_NOTES_CHARS: usize = 4000;
/// Maximum characters in a name, company or vehicle field.
pub const MAX_SHORT_TEXT_CHARS: usize = 200;
/// Maximum characters in a phone number or part reference.
pub const MAX_CODE_CHARS: usize = 64;

const MIN_VEHICLE_YEAR: u16 = 1900;
const MAX_VEHICLE_YEAR: u16 = 2100;

/// Errors produced while validating a quote submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuoteValidationError {
    /// A required text field is blank.
    #[error("{field} is required")]
    Required {
        /// Field name.
        field: &'static str,
    },
    /// A text field exceeds its limit.
    #[error("{field} must be at most {max} characters")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Limit in characters.
        max: usize,
    },
    /// The contact email is malformed.
    #[error("invalid email: {0}")]
    Email(#[from] EmailError),
    /// No request lines were submitted.
    #[error("at least one line is required")]
    NoLines,
    /// Too many request lines.
    #[error("at most {max} lines are allowed")]
    TooManyLines {
        /// Limit.
        max: usize,
    },
    /// A line's description is blank or too long.
    #[error("line {line}: description must be 1-{max} characters")]
    LineDescription {
        /// 1-based line number.
        line: usize,
        /// Limit in characters.
        max: usize,
    },
    /// A line's quantity is out of range.
    #[error("line {line}: quantity must be between 1 and {max}")]
    LineQuantity {
        /// 1-based line number.
        line: usize,
        /// Upper bound.
        max: u32,
    },
    /// The vehicle year is implausible.
    #[error("vehicle year {0} is out of range")]
    VehicleYear(u16),
    /// This kind of request needs vehicle details.
    #[error("{0} requests require vehicle details")]
    VehicleRequired(QuoteKind),
    /// Wholesale applications need a company name.
    #[error("wholesale applications require a company")]
    CompanyRequired,
}

/// Which entry point a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteKind {
    /// Shop service (install, tune, alignment).
    Service,
    /// Wheel fitment and specification.
    WheelSpec,
    /// Wholesale account application.
    Wholesale,
}

impl QuoteKind {
    /// Snake-case tag as stored and sent in notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::WheelSpec => "wheel_spec",
            Self::Wholesale => "wholesale",
        }
    }

    const fn requires_vehicle(self) -> bool {
        matches!(self, Self::Service | Self::WheelSpec)
    }
}

impl std::fmt::Display for QuoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contact details as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactInfo {
    /// Customer name.
    pub name: String,
    /// Email, validated into an [`Email`].
    pub email: String,
    /// Optional phone number.
    #[serde(default)]
    pub phone: Option<String>,
    /// Optional company (required for wholesale).
    #[serde(default)]
    pub company: Option<String>,
}

/// Validated contact details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Customer name.
    pub name: String,
    /// Normalized email.
    pub email: Email,
    /// Phone number, if given.
    pub phone: Option<String>,
    /// Company, if given.
    pub company: Option<String>,
}

/// Vehicle the request is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VehicleInfo {
    /// Model year.
    pub year: u16,
    /// Manufacturer.
    pub make: String,
    /// Model.
    pub model: String,
}

/// One itemized line of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuoteLine {
    /// What is being asked for.
    pub description: String,
    /// How many.
    pub quantity: u32,
    /// Optional part number or SKU.
    #[serde(default)]
    pub reference: Option<String>,
}

/// A quote submission as received from a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewQuoteRequest {
    /// Entry point.
    pub kind: QuoteKind,
    /// Contact details.
    pub contact: ContactInfo,
    /// Vehicle, required for service and wheel-spec requests.
    #[serde(default)]
    pub vehicle: Option<VehicleInfo>,
    /// Requested items.
    pub lines: Vec<QuoteLine>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated quote request ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Locally minted id.
    pub id: QuoteRequestId,
    /// Entry point.
    pub kind: QuoteKind,
    /// Validated contact.
    pub contact: Contact,
    /// Vehicle, if given.
    pub vehicle: Option<VehicleInfo>,
    /// Requested items, trimmed.
    pub lines: Vec<QuoteLine>,
    /// Notes, if any.
    pub notes: Option<String>,
    /// Always [`QuoteStatus::New`] at creation.
    pub status: QuoteStatus,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

fn required_text(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<String, QuoteValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(QuoteValidationError::Required { field });
    }
    if value.chars().count() > max {
        return Err(QuoteValidationError::TooLong { field, max });
    }
    Ok(value.to_owned())
}

fn optional_text(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<Option<String>, QuoteValidationError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) if v.chars().count() > max => Err(QuoteValidationError::TooLong { field, max }),
        Some(v) => Ok(Some(v.to_owned())),
    }
}

impl NewQuoteRequest {
    /// Validate the submission and mint a new request.
    ///
    /// # Errors
    ///
    /// Returns the first rule the submission violates.
    pub fn validate(
        self,
        id: QuoteRequestId,
        submitted_at: DateTime<Utc>,
    ) -> Result<QuoteRequest, QuoteValidationError> {
        let contact = Contact {
            name: required_text("name", &self.contact.name, MAX_SHORT_TEXT_CHARS)?,
            email: Email::parse(&self.contact.email)?,
            phone: optional_text("phone", self.contact.phone.as_deref(), MAX_CODE_CHARS)?,
            company: optional_text(
                "company",
                self.contact.company.as_deref(),
                MAX_SHORT_TEXT_CHARS,
            )?,
        };

        let vehicle = self
            .vehicle
            .map(|v| -> Result<VehicleInfo, QuoteValidationError> {
                if !(MIN_VEHICLE_YEAR..=MAX_VEHICLE_YEAR).contains(&v.year) {
                    return Err(QuoteValidationError::VehicleYear(v.year));
                }
                Ok(VehicleInfo {
                    year: v.year,
                    make: required_text("vehicle make", &v.make, MAX_SHORT_TEXT_CHARS)?,
                    model: required_text("vehicle model", &v.model, MAX_SHORT_TEXT_CHARS)?,
                })
            })
            .transpose()?;

        if self.kind.requires_vehicle() && vehicle.is_none() {
            return Err(QuoteValidationError::VehicleRequired(self.kind));
        }
        if self.kind == QuoteKind::Wholesale && contact.company.is_none() {
            return Err(QuoteValidationError::CompanyRequired);
        }

        if self.lines.is_empty() {
            return Err(QuoteValidationError::NoLines);
        }
        if self.lines.len() > MAX_LINES {
            return Err(QuoteValidationError::TooManyLines { max: MAX_LINES });
        }
        let lines = self
            .lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| validate_line(index + 1, line))
            .collect::<Result<Vec<_>, _>>()?;

        let notes = optional_text("notes", self.notes.as_deref(), MAX_NOTES_CHARS)?;

        Ok(QuoteRequest {
            id,
            kind: self.kind,
            contact,
            vehicle,
            lines,
            notes,
            status: QuoteStatus::New,
            submitted_at,
        })
    }
}

fn validate_line(line: usize, input: QuoteLine) -> Result<QuoteLine, QuoteValidationError> {
    let description = input.description.trim();
    if description.is_empty() || description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(QuoteValidationError::LineDescription {
            line,
            max: MAX_DESCRIPTION_CHARS,
        });
    }
    if !(1..=MAX_QUANTITY).contains(&input.quantity) {
        return Err(QuoteValidationError::LineQuantity {
            line,
            max: MAX_QUANTITY,
        });
    }
    Ok(QuoteLine {
        description: description.to_owned(),
        quantity: input.quantity,
        reference: optional_text("reference", input.reference.as_deref(), MAX_CODE_CHARS)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn submission(kind: QuoteKind) -> NewQuoteRequest {
        NewQuoteRequest {
            kind,
            contact: ContactInfo {
                name: " Sam Rivera ".to_string(),
                email: "Sam@Example.com".to_string(),
                phone: Some(String::new()),
                company: None,
            },
            vehicle: Some(VehicleInfo {
                year: 2019,
                make: "Subaru".to_string(),
                model: "WRX STI".to_string(),
            }),
            lines: vec![QuoteLine {
                description: "Stage 2 tune".to_string(),
                quantity: 1,
                reference: None,
            }],
            notes: None,
        }
    }

    fn validate(req: NewQuoteRequest) -> Result<QuoteRequest, QuoteValidationError> {
        req.validate(QuoteRequestId::new_random(), Utc::now())
    }

    #[test]
    fn test_valid_service_request() {
        let quote = validate(submission(QuoteKind::Service)).unwrap();
        assert_eq!(quote.status, QuoteStatus::New);
        assert_eq!(quote.contact.name, "Sam Rivera");
        assert_eq!(quote.contact.email.as_str(), "sam@example.com");
        assert_eq!(quote.contact.phone, None);
    }

    #[test]
    fn test_vehicle_required_for_service_and_wheel_spec() {
        for kind in [QuoteKind::Service, QuoteKind::WheelSpec] {
            let mut req = submission(kind);
            req.vehicle = None;
            assert_eq!(
                validate(req),
                Err(QuoteValidationError::VehicleRequired(kind))
            );
        }
    }

    #[test]
    fn test_wholesale_requires_company() {
        let mut req = submission(QuoteKind::Wholesale);
        req.vehicle = None;
        assert_eq!(
            validate(req.clone()),
            Err(QuoteValidationError::CompanyRequired)
        );

        req.contact.company = Some("Boost Bros LLC".to_string());
        assert!(validate(req).is_ok());
    }

    #[test]
    fn test_line_rules() {
        let mut req = submission(QuoteKind::Service);
        req.lines.clear();
        assert_eq!(validate(req), Err(QuoteValidationError::NoLines));

        let mut req = submission(QuoteKind::Service);
        req.lines[0].quantity = 0;
        assert!(matches!(
            validate(req),
            Err(QuoteValidationError::LineQuantity { line: 1, .. })
        ));

        let mut req = submission(QuoteKind::Service);
        req.lines[0].description = "x".repeat(MAX_DESCRIPTION_CHARS + 1);
        assert!(matches!(
            validate(req),
            Err(QuoteValidationError::LineDescription { line: 1, .. })
        ));

        let mut req = submission(QuoteKind::Service);
        req.lines = vec![req.lines[0].clone(); MAX_LINES + 1];
        assert!(matches!(
            validate(req),
            Err(QuoteValidationError::TooManyLines { .. })
        ));
    }

    #[test]
    fn test_notes_limit() {
        let mut req = submission(QuoteKind::Service);
        req.notes = Some("n".repeat(MAX_NOTES_CHARS + 1));
        assert!(matches!(
            validate(req),
            Err(QuoteValidationError::TooLong { field: "notes", .. })
        ));
    }

    #[test]
    fn test_invalid_email_and_year() {
        let mut req = submission(QuoteKind::Service);
        req.contact.email = "not-an-email".to_string();
        assert!(matches!(validate(req), Err(QuoteValidationError::Email(_))));

        let mut req = submission(QuoteKind::Service);
        if let Some(v) = req.vehicle.as_mut() {
            v.year = 1850;
        }
        assert_eq!(validate(req), Err(QuoteValidationError::VehicleYear(1850)));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = serde_json::json!({
            "kind": "service",
            "contact": { "name": "A", "email": "a@b.co" },
            "lines": [{ "description": "Dyno pull", "quantity": 1 }],
            "discount": 50
        });
        assert!(serde_json::from_value::<NewQuoteRequest>(json).is_err());
    }
}
