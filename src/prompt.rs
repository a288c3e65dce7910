//! Renders the grading instructions and per-listing prompts.
//!
//! `build_instructions` must stay a pure function of its inputs: the rendered
//! block is sent as the system message on every call of a run, and identical
//! bytes let the model provider cache it.

use crate::models::{Feedback, GradingCriteria, Listing};
use serde::Serialize;
use std::fmt::Write;

const DESCRIPTION_LIMIT: usize = 2000;

const RESPONSE_FORMAT: &str = r#"## Response format
Respond with a single JSON object and nothing else: no prose, no markdown, no code fences.
{"score": <integer 0-100>, "grade": "<A|B|C|D|F>", "rationale": "<one or two sentences>", "flags": ["<short tag>", ...]}
Use an empty array for flags when nothing stands out."#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstructionBlock {
    pub version: String,
    pub text: String,
    pub disagreements: usize,
    pub agreements: usize,
}

pub fn build_instructions(
    criteria: &GradingCriteria,
    disagreements: &[Feedback],
    agreements: &[Feedback],
) -> InstructionBlock {
    let mut text = String::new();
    text.push_str(criteria.criteria_prompt.trim());
    text.push_str("\n\n");

    if !disagreements.is_empty() {
        text.push_str("## Past grades reviewers corrected\n");
        text.push_str("Avoid repeating these mistakes.\n");
        for feedback in disagreements {
            render_feedback(&mut text, feedback);
        }
        text.push('\n');
    }

    if !agreements.is_empty() {
        text.push_str("## Past grades reviewers confirmed\n");
        for feedback in agreements {
            render_feedback(&mut text, feedback);
        }
        text.push('\n');
    }

    text.push_str(RESPONSE_FORMAT);
    InstructionBlock {
        version: criteria.version.clone(),
        text,
        disagreements: disagreements.len(),
        agreements: agreements.len(),
    }
}

fn render_feedback(out: &mut String, feedback: &Feedback) {
    let _ = write!(
        out,
        "- \"{}\": graded {} ({}/100)",
        single_line(&feedback.listing_title),
        feedback.grade,
        feedback.score
    );
    if let Some(adjusted) = feedback.adjusted_score {
        let _ = write!(out, "; reviewer adjusted to {adjusted}/100");
    }
    if let Some(notes) = feedback.notes.as_deref().map(single_line).filter(|n| !n.is_empty()) {
        let _ = write!(out, ". Reviewer notes: {notes}");
    }
    out.push('\n');
}

pub fn build_item_prompt(listing: &Listing) -> String {
    let data = &listing.data;
    let mut out = String::from("Grade this listing.\n\n");
    let _ = writeln!(out, "Title: {}", single_line(&data.title));
    let price = if data.price.is_empty() {
        "not listed"
    } else {
        data.price.as_str()
    };
    let _ = writeln!(out, "Price: {price}");
    let optional = [
        ("Condition", data.condition.as_deref()),
        ("Location", data.location.as_deref()),
        ("Listed", data.listing_date.as_deref()),
        ("Seller", data.seller_name.as_deref()),
    ];
    for (label, value) in optional {
        if let Some(value) = value {
            let _ = writeln!(out, "{label}: {}", single_line(value));
        }
    }
    let _ = writeln!(out, "Source: {}", data.source);
    let _ = writeln!(out, "Link: {}", data.link);
    let _ = writeln!(
        out,
        "Photo: {}",
        if data.image.is_some() { "yes" } else { "none" }
    );
    match data.description.as_deref() {
        Some(description) => {
            let _ = write!(out, "\nDescription:\n{}", truncate(description, DESCRIPTION_LIMIT));
        }
        None => out.push_str("\nDescription: (none provided)"),
    }
    out
}

fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(value: &str, limit: usize) -> &str {
    match value.char_indices().nth(limit) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
