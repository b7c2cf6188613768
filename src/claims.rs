//! Standard OpenID Connect claims.
//!
//! ID tokens and user-info responses are both decoded into [`Claims`]. Header injection
//! looks claims up by name through `CLAIM_TABLE`, which pairs every [`ClaimKind`] with its
//! wire name and an accessor producing the header-ready string.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Claims {
    #[serde(deserialize_with = "lenient_string")]
    pub sub: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub family_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub given_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub middle_name: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub nickname: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub preferred_username: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub profile: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub picture: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub website: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub gender: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub birthdate: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub zoneinfo: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub locale: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub updated_at: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub email_verified: Option<bool>,
    #[serde(deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub phone_number: Option<String>,
    #[serde(deserialize_with = "lenient_bool")]
    pub phone_number_verified: Option<bool>,
}

/// Providers disagree on claim encodings: `updated_at` is a number, `address` an object.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => {
            let formatted = map.get("formatted").and_then(Value::as_str).map(str::to_string);
            Some(formatted.unwrap_or_else(|| Value::Object(map).to_string()))
        }
        array @ Value::Array(_) => Some(array.to_string()),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimKind {
    Subject,
    Name,
    FamilyName,
    GivenName,
    MiddleName,
    Nickname,
    PreferredUsername,
    Profile,
    Picture,
    Website,
    Gender,
    Birthdate,
    Zoneinfo,
    Locale,
    UpdatedAt,
    Email,
    EmailVerified,
    Address,
    PhoneNumber,
    PhoneNumberVerified,
}

type Accessor = fn(&Claims) -> Option<String>;

fn text(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

fn flag(value: Option<bool>) -> Option<String> {
    value.map(|b| if b { "true" } else { "false" }.to_string())
}

/// Indexed by `ClaimKind as usize`.
static CLAIM_TABLE: [(ClaimKind, &str, Accessor); 20] = [
    (ClaimKind::Subject, "sub", |c| text(&c.sub)),
    (ClaimKind::Name, "name", |c| text(&c.name)),
    (ClaimKind::FamilyName, "family_name", |c| text(&c.family_name)),
    (ClaimKind::GivenName, "given_name", |c| text(&c.given_name)),
    (ClaimKind::MiddleName, "middle_name", |c| text(&c.middle_name)),
    (ClaimKind::Nickname, "nickname", |c| text(&c.nickname)),
    (ClaimKind::PreferredUsername, "preferred_username", |c| text(&c.preferred_username)),
    (ClaimKind::Profile, "profile", |c| text(&c.profile)),
    (ClaimKind::Picture, "picture", |c| text(&c.picture)),
    (ClaimKind::Website, "website", |c| text(&c.website)),
    (ClaimKind::Gender, "gender", |c| text(&c.gender)),
    (ClaimKind::Birthdate, "birthdate", |c| text(&c.birthdate)),
    (ClaimKind::Zoneinfo, "zoneinfo", |c| text(&c.zoneinfo)),
    (ClaimKind::Locale, "locale", |c| text(&c.locale)),
    (ClaimKind::UpdatedAt, "updated_at", |c| text(&c.updated_at)),
    (ClaimKind::Email, "email", |c| text(&c.email)),
    (ClaimKind::EmailVerified, "email_verified", |c| flag(c.email_verified)),
    (ClaimKind::Address, "address", |c| text(&c.address)),
    (ClaimKind::PhoneNumber, "phone_number", |c| text(&c.phone_number)),
    (ClaimKind::PhoneNumberVerified, "phone_number_verified", |c| {
        flag(c.phone_number_verified)
    }),
];

impl ClaimKind {
    pub fn from_name(name: &str) -> Option<Self> {
        CLAIM_TABLE
            .iter()
            .find(|(_, claim_name, _)| *claim_name == name)
            .map(|(kind, _, _)| *kind)
    }

    pub fn name(self) -> &'static str {
        CLAIM_TABLE[self as usize].1
    }

    /// The claim as a header value: non-empty strings as-is, booleans as `true`/`false`.
    pub fn value_in(self, claims: &Claims) -> Option<String> {
        (CLAIM_TABLE[self as usize].2)(claims)
    }
}
