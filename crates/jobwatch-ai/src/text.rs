use jobwatch_core::JobAttributes;

/// Upper bound, in characters, for embedding input.
pub const EMBEDDING_TEXT_LIMIT: usize = 8000;

fn field_or<'a>(value: &'a Option<String>, fallback: &'a str) -> &'a str {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
}

/// User message sent to the scorer for one listing.
pub fn scoring_input(attrs: &JobAttributes) -> String {
    format!(
        "Title: {}\nCompany: {}\nLocation: {}\nDescription: {}",
        field_or(&attrs.title, "N/A"),
        field_or(&attrs.company, "N/A"),
        field_or(&attrs.location, "N/A"),
        field_or(&attrs.description, "N/A"),
    )
}

/// Text embedded for a listing. Location, company and title are repeated so
/// they weigh more in similarity search than the free-form description.
///
/// Output never exceeds [`EMBEDDING_TEXT_LIMIT`] characters unless the header
/// alone does; only the description is cut.
pub fn embedding_text(attrs: &JobAttributes) -> String {
    let title = field_or(&attrs.title, "Job");
    let company = field_or(&attrs.company, "Company");
    let location = field_or(&attrs.location, "Location not specified");
    let description = field_or(&attrs.description, "");

    let header = format!(
        "Location: {location}\n\
         Company: {company}\n\
         Title: {title}\n\
         Location: {location}\n\
         Company: {company}\n\
         {company} - {title}\n\
         Location: {location}\n\
         Description: {company} - {title}. "
    );

    let full = format!("{header}{description}");
    let full = full.trim_end();
    if full.chars().count() <= EMBEDDING_TEXT_LIMIT {
        return full.to_string();
    }

    let room = EMBEDDING_TEXT_LIMIT.saturating_sub(header.chars().count() + 3);
    let kept: String = description.chars().take(room).collect();
    format!("{header}{kept}...")
}
