//! Small helpers shared by the feed, command and notification layers.
//!
//! - **URL validation**: only absolute `http`/`https` URLs may become subscriptions
//! - **Text processing**: HTML escaping for chat markup and title truncation

mod text;
mod url_validator;

pub use text::{escape_html, escape_html_attr, truncate_title, unescape_html};
pub use url_validator::{validate_url, UrlValidationError};
