//! Field rules for account input.
//!
//! Each input type exposes its fields by name; a static table of
//! [`FieldRule`]s is checked against them and every violation is collected.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use time::{format_description::FormatItem, macros::format_description, Date, OffsetDateTime};

use super::dto::{ChangePasswordRequest, RegisterRequest, VerifyEmailRequest};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Email,
    /// `YYYY-MM-DD`
    Date,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    MinChars(usize),
    MaxChars(usize),
    UsernameCharset,
    PastDate,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub constraints: &'static [Constraint],
}

pub const PASSWORD_RULE: FieldRule = FieldRule {
    field: "password",
    kind: FieldKind::Secret,
    required: true,
    constraints: &[Constraint::MaxChars(1024)],
};

pub const NEW_PASSWORD_RULE: FieldRule = FieldRule {
    field: "newPassword",
    ..PASSWORD_RULE
};

pub const VERIFY_TOKEN_RULE: FieldRule = FieldRule {
    field: "token",
    kind: FieldKind::Text,
    required: true,
    constraints: &[Constraint::MaxChars(128)],
};

pub const REGISTER_RULES: &[FieldRule] = &[
    FieldRule {
        field: "username",
        kind: FieldKind::Text,
        required: true,
        constraints: &[
            Constraint::MinChars(3),
            Constraint::MaxChars(32),
            Constraint::UsernameCharset,
        ],
    },
    FieldRule {
        field: "email",
        kind: FieldKind::Email,
        required: true,
        constraints: &[Constraint::MaxChars(254)],
    },
    PASSWORD_RULE,
    FieldRule {
        field: "birthday",
        kind: FieldKind::Date,
        required: true,
        constraints: &[Constraint::PastDate],
    },
    FieldRule {
        field: "bio",
        kind: FieldKind::Text,
        required: false,
        constraints: &[Constraint::MaxChars(500)],
    },
];

/// Input whose fields can be looked up by rule name.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<&str>;
}

pub fn parse_date(value: &str) -> Option<Date> {
    Date::parse(value.trim(), DATE_FORMAT).ok()
}

fn check_kind(rule: &FieldRule, value: &str) -> Option<String> {
    match rule.kind {
        FieldKind::Text | FieldKind::Secret => None,
        FieldKind::Email => {
            (!EMAIL_RE.is_match(value)).then(|| "must be a valid email address".to_string())
        }
        FieldKind::Date => {
            parse_date(value).is_none().then(|| "must be a date formatted YYYY-MM-DD".to_string())
        }
    }
}

fn check_constraint(constraint: Constraint, value: &str, today: Date) -> Option<String> {
    let chars = value.chars().count();
    match constraint {
        Constraint::MinChars(min) if chars < min => {
            Some(format!("must be at least {min} characters"))
        }
        Constraint::MaxChars(max) if chars > max => {
            Some(format!("must be at most {max} characters"))
        }
        Constraint::UsernameCharset if !USERNAME_RE.is_match(value) => {
            Some("may only contain letters, digits, '_', '.' and '-'".to_string())
        }
        Constraint::PastDate => match parse_date(value) {
            Some(date) if date >= today => Some("must be in the past".to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Checks `input` against `rules`, returning every violation.
pub fn validate(rules: &[FieldRule], input: &dyn FieldSource) -> Vec<FieldError> {
    let today = OffsetDateTime::now_utc().date();
    let mut errors = Vec::new();

    for rule in rules {
        let value = input.field(rule.field).unwrap_or_default();
        let blank = match rule.kind {
            FieldKind::Secret => value.is_empty(),
            _ => value.trim().is_empty(),
        };
        if blank {
            if rule.required {
                errors.push(FieldError::new(rule.field, "is required"));
            }
            continue;
        }

        if let Some(message) = check_kind(rule, value) {
            errors.push(FieldError::new(rule.field, message));
            continue;
        }

        for constraint in rule.constraints {
            if let Some(message) = check_constraint(*constraint, value, today) {
                errors.push(FieldError::new(rule.field, message));
            }
        }
    }

    errors
}

/// Validated registration input.
#[derive(Clone)]
pub struct RegisterInput {
    pub username: String,
    pub email: String,
    pub password: String,
    pub birthday: Date,
    pub bio: Option<String>,
}

impl FieldSource for RegisterRequest {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "username" => Some(self.username.as_str()),
            "email" => Some(self.email.as_str()),
            "password" => Some(self.password.as_str()),
            "birthday" => Some(self.birthday.as_str()),
            "bio" => self.bio.as_deref(),
            _ => None,
        }
    }
}

impl RegisterRequest {
    /// Normalizes, validates and maps the request into [`RegisterInput`].
    pub fn into_input(mut self) -> Result<RegisterInput, Vec<FieldError>> {
        self.email = self.email.trim().to_lowercase();

        let errors = validate(REGISTER_RULES, &self);
        if !errors.is_empty() {
            return Err(errors);
        }

        let birthday = parse_date(&self.birthday)
            .ok_or_else(|| vec![FieldError::new("birthday", "must be a date formatted YYYY-MM-DD")])?;
        let bio = self.bio.map(|b| b.trim().to_string()).filter(|b| !b.is_empty());

        Ok(RegisterInput {
            username: self.username,
            email: self.email,
            password: self.password,
            birthday,
            bio,
        })
    }
}

impl FieldSource for ChangePasswordRequest {
    fn field(&self, name: &str) -> Option<&str> {
        match name {
            "currentPassword" => Some(self.current_password.as_str()),
            "newPassword" => Some(self.new_password.as_str()),
            _ => None,
        }
    }
}

impl FieldSource for VerifyEmailRequest {
    fn field(&self, name: &str) -> Option<&str> {
        (name == "token").then_some(self.token.as_str())
    }
}
