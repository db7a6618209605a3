use std::collections::HashMap;

use once_cell::sync::Lazy;

/// OpenAI model identifiers mapped to their Gemini equivalents. The upstream
/// call uses the mapped name; responses echo the name the client asked for.
static MODEL_MAPPINGS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4", "gemini-1.5-pro-latest"),
        ("gpt-4-turbo", "gemini-1.5-pro-latest"),
        ("gpt-4o", "gemini-1.5-flash-latest"),
        ("gpt-4o-mini", "gemini-1.5-flash-8b-latest"),
        ("gpt-3.5-turbo", "gemini-1.5-flash-latest"),
        ("gemini-1.5-pro", "gemini-1.5-pro-latest"),
        ("gemini-1.5-flash", "gemini-1.5-flash-latest"),
        ("gemini-2.0-flash", "gemini-2.0-flash"),
    ])
});

/// Maps an OpenAI model name to its Gemini equivalent; unknown names pass
/// through unchanged.
pub fn map_model_name(model: &str) -> &str {
    MODEL_MAPPINGS.get(model).copied().unwrap_or(model)
}

/// Model ids advertised on GET /v1/models.
pub fn advertised_models() -> impl Iterator<Item = &'static str> {
    [
        "gpt-4",
        "gpt-4-turbo",
        "gpt-4o",
        "gpt-4o-mini",
        "gpt-3.5-turbo",
        "gemini-1.5-pro-latest",
        "gemini-1.5-flash-latest",
        "gemini-2.0-flash",
    ]
    .into_iter()
}
