//! Maps heterogeneous source output onto [`ScrapedListing`].
//!
//! Feeds disagree on field names and types (numeric vs string ids, prices as
//! numbers or display strings, nested seller objects). `from_raw` picks the
//! first usable candidate for every field, and `canonicalize` cleans the
//! result so that `link` can serve as the unique key downstream.

use crate::models::{ListingSource, ScrapedListing};
use serde_json::Value;

const TITLE_KEYS: &[&str] = &["title", "name", "heading"];
const PRICE_KEYS: &[&str] = &["price", "price_display", "formatted_price"];
const LINK_KEYS: &[&str] = &["link", "url", "href", "permalink"];
const IMAGE_KEYS: &[&str] = &["image", "image_url", "thumbnail"];
const ID_KEYS: &[&str] = &["external_id", "id", "listing_id", "pid"];
const DATE_KEYS: &[&str] = &["listing_date", "posted_at", "date", "created_time"];
const LOCATION_KEYS: &[&str] = &["location", "city", "hood", "neighborhood"];
const DESCRIPTION_KEYS: &[&str] = &["description", "body"];

pub fn from_raw(source: ListingSource, raw: &Value) -> Option<ScrapedListing> {
    let obj = raw.as_object()?;
    let title = first_text(raw, TITLE_KEYS)?;
    let link = first_text(raw, LINK_KEYS)?;

    let price = PRICE_KEYS
        .iter()
        .filter_map(|key| obj.get(*key))
        .find_map(price_display)
        .unwrap_or_default();

    let image = first_text(raw, IMAGE_KEYS).or_else(|| {
        obj.get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .and_then(text_of)
    });

    let seller_name = first_text(raw, &["seller_name"]).or_else(|| match obj.get("seller") {
        Some(Value::Object(seller)) => seller.get("name").and_then(text_of),
        Some(other) => text_of(other),
        None => None,
    });

    let listing = ScrapedListing {
        title,
        price,
        price_cents: obj.get("price_cents").and_then(Value::as_i64),
        link,
        image,
        source,
        external_id: first_text(raw, ID_KEYS),
        condition: first_text(raw, &["condition"]),
        listing_date: first_text(raw, DATE_KEYS),
        location: first_text(raw, LOCATION_KEYS),
        seller_name,
        description: first_text(raw, DESCRIPTION_KEYS),
        raw_data: raw.clone(),
    };
    canonicalize(listing)
}

/// Cleans a listing in place. Returns `None` when the record cannot be keyed.
pub fn canonicalize(mut listing: ScrapedListing) -> Option<ScrapedListing> {
    listing.title = listing.title.trim().to_string();
    if listing.title.is_empty() {
        return None;
    }
    listing.link = canonical_link(&listing.link)?;
    listing.price = listing.price.trim().to_string();

    for field in [
        &mut listing.image,
        &mut listing.external_id,
        &mut listing.condition,
        &mut listing.listing_date,
        &mut listing.location,
        &mut listing.seller_name,
        &mut listing.description,
    ] {
        *field = field
            .take()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
    }

    if listing.external_id.is_none() {
        listing.external_id = external_id_from_link(listing.source, &listing.link);
    }
    if listing.price_cents.is_none() {
        listing.price_cents = parse_price_cents(&listing.price);
    }
    Some(listing)
}

/// Strips query and fragment, lowercases scheme and host. Non-http links are rejected.
pub fn canonical_link(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let (scheme, rest) = trimmed.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{}{path}", host.to_ascii_lowercase()))
}

fn external_id_from_link(source: ListingSource, link: &str) -> Option<String> {
    match source {
        ListingSource::Craigslist => {
            let last = link.trim_end_matches('/').rsplit('/').next()?;
            let digits = last.strip_suffix(".html")?;
            all_digits(digits).then(|| digits.to_string())
        }
        ListingSource::Facebook => {
            let (_, tail) = link.split_once("/marketplace/item/")?;
            let id = tail.split('/').next()?;
            all_digits(id).then(|| id.to_string())
        }
    }
}

fn all_digits(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Parses a display price into cents. `"$1,250.50"` → `125050`, `"free"` → `0`.
pub fn parse_price_cents(price: &str) -> Option<i64> {
    let trimmed = price.trim();
    if trimmed.eq_ignore_ascii_case("free") {
        return Some(0);
    }
    let cleaned: String = trimmed
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let (whole, frac) = match cleaned.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (cleaned.as_str(), ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let cents = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac[..2].parse::<i64>().ok()?,
    };
    whole.checked_mul(100)?.checked_add(cents)
}

fn first_text(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|key| raw.get(*key)).find_map(text_of)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn price_display(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_f64().map(|amount| {
            if amount.fract() == 0.0 {
                format!("${amount:.0}")
            } else {
                format!("${amount:.2}")
            }
        }),
        other => text_of(other),
    }
}
