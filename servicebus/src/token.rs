//! Time-windowed message tokens.
//!
//! A token is the lowercase hex SHA-1 digest of `"<secret> - <YYYY-MM-DD>"`.
//! Senders stamp every request with the token for their local date; receivers
//! accept tokens computed for yesterday, today or tomorrow relative to their
//! own local date.  Tokens are not single-use.

use {
    chrono::{Days, Local, NaiveDate},
    sha1::{Digest, Sha1},
};

/// Compute the token for `secret` on `date`.
pub fn generate_token(secret: &str, date: NaiveDate) -> String {
    let seed = format!("{} - {}", secret, date.format("%Y-%m-%d"));
    hex::encode(Sha1::digest(seed.as_bytes()))
}

/// Token for the local date right now.
pub fn current_token(secret: &str) -> String {
    generate_token(secret, today())
}

/// Validate `token` against the three-day window centred on `today`.
pub fn validate_token_on(token: &str, secret: &str, today: NaiveDate) -> bool {
    accepted_dates(today)
        .into_iter()
        .any(|date| generate_token(secret, date) == token)
}

/// Validate `token` against the window centred on the local date.
pub fn validate_token(token: &str, secret: &str) -> bool {
    validate_token_on(token, secret, today())
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn accepted_dates(today: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = vec![today];
    dates.extend(today.checked_sub_days(Days::new(1)));
    dates.extend(today.checked_add_days(Days::new(1)));
    dates
}
