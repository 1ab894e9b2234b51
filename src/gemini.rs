use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{sanitize_error_copy, AppError, AppResult};
use crate::model::{FilterCriteria, Listing, ListingsPage, Source, WeatherSnapshot};
use crate::source::RentalDataSource;

const MAX_SUGGESTIONS: usize = 5;
const MAX_ERROR_BODY_CHARS: usize = 300;

const LISTING_SHAPE: &str = r#"interface Property {
  id: string; // A unique identifier
  address: string;
  city: string;
  state: string;
  zip: string;
  price: number; // Monthly rental price in USD
  bedrooms: number;
  bathrooms: number; // Can be a float, e.g., 1.5
  sqft: number;
  propertyType: 'Apartment' | 'House' | 'Condo' | 'Townhouse';
  amenities: string[]; // 4-6 key amenities
  imageUrl: string; // https://picsum.photos/seed/{unique_word}/800/600
  lat: number;
  lng: number;
  isRentToOwn?: boolean;
  privateSchools?: { name: string; distance: string }[];
  contact?: { name?: string; phone?: string; email?: string };
}"#;

const ENHANCE_INSTRUCTION: &str = "Enhance this real-estate photo: improve lighting, \
sharpness and color balance while keeping the property exactly as it is.";

pub struct GeminiDataSource {
    http: Client,
    api_key: SecretString,
    api_base: String,
    text_model: String,
    image_model: String,
    listings_per_search: usize,
}

impl GeminiDataSource {
    pub fn maybe_new(config: &AppConfig) -> AppResult<Option<Self>> {
        let Some(api_key) = config.gemini_api_key.clone() else {
            return Ok(None);
        };
        let http = Client::builder()
            .user_agent(concat!("rental-scout/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Some(Self {
            http,
            api_key,
            api_base: config.gemini_api_base.trim_end_matches('/').to_string(),
            text_model: config.text_model.clone(),
            image_model: config.image_model.clone(),
            listings_per_search: config.listings_per_search,
        }))
    }

    async fn generate(&self, model: &str, body: Value) -> AppResult<GenerateResponse> {
        let url = format!("{}/models/{}:generateContent", self.api_base, model);
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let excerpt: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
            let excerpt = sanitize_error_copy(&excerpt);
            if status == StatusCode::TOO_MANY_REQUESTS || text.contains("RESOURCE_EXHAUSTED") {
                return Err(AppError::RateLimited(format!("{status}: {excerpt}")));
            }
            return Err(AppError::Remote(format!("{status}: {excerpt}")));
        }

        serde_json::from_str(&text).map_err(|err| {
            AppError::MalformedResponse(format!("unexpected generateContent envelope: {err}"))
        })
    }

    async fn generate_json<T: serde::de::DeserializeOwned>(
        &self,
        prompt: String,
        schema: Value,
    ) -> AppResult<T> {
        let response = self
            .generate(
                &self.text_model,
                json!({
                    "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                    "generationConfig": {
                        "responseMimeType": "application/json",
                        "responseSchema": schema,
                    },
                }),
            )
            .await?;
        parse_payload(&response.text()?)
    }

    async fn generate_image_part(&self, parts: Vec<Value>) -> AppResult<String> {
        let response = self
            .generate(
                &self.image_model,
                json!({
                    "contents": [{ "role": "user", "parts": parts }],
                    "generationConfig": { "responseModalities": ["IMAGE"] },
                }),
            )
            .await?;
        let inline = response
            .first_candidate()
            .and_then(|candidate| candidate.content.as_ref())
            .and_then(|content| content.parts.iter().find_map(|part| part.inline_data.as_ref()))
            .ok_or_else(|| AppError::MalformedResponse("image response had no inline data".into()))?;
        Ok(format!("data:{};base64,{}", inline.mime_type, inline.data))
    }
}

#[async_trait]
impl RentalDataSource for GeminiDataSource {
    async fn fetch_listings(
        &self,
        place: &str,
        filters: &FilterCriteria,
    ) -> AppResult<ListingsPage> {
        let prompt = format!(
            "Search the web extensively to find a diverse and realistic list of {count} rental \
             property listings in {place} with {criteria}. Look for properties from various \
             sources like real estate websites, apartment complex sites, and local classifieds. \
             Format the response as a valid JSON array of objects. Each object must conform to \
             this TypeScript interface:\n{LISTING_SHAPE}\nEnsure the entire response is only the \
             JSON array, with no surrounding text or markdown.",
            count = self.listings_per_search,
            criteria = filters.describe(),
        );

        let response = self
            .generate(
                &self.text_model,
                json!({
                    "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                    "tools": [{ "google_search": {} }],
                }),
            )
            .await?;

        let rows: Vec<Value> = parse_payload(&response.text()?)?;
        let listings = decode_listing_rows(rows)?;
        let sources = response.sources();
        debug!(place, count = listings.len(), sources = sources.len(), "listings generated");
        Ok(ListingsPage { listings, sources })
    }

    async fn fetch_weather(&self, place: &str) -> AppResult<WeatherSnapshot> {
        let prompt = format!(
            "Get the current weather for {place}. Provide the temperature in Fahrenheit, a short \
             weather condition description, and the wind speed in mph."
        );
        self.generate_json(
            prompt,
            json!({
                "type": "OBJECT",
                "properties": {
                    "temperature": { "type": "NUMBER", "description": "Current temperature in Fahrenheit." },
                    "condition": { "type": "STRING", "description": "Short condition, e.g. \"Sunny\"." },
                    "windSpeed": { "type": "NUMBER", "description": "Wind speed in mph." }
                },
                "required": ["temperature", "condition", "windSpeed"]
            }),
        )
        .await
    }

    async fn fetch_location_suggestions(&self, partial: &str) -> AppResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Suggestions {
            #[serde(default)]
            suggestions: Vec<String>,
        }

        if partial.trim().is_empty() {
            return Ok(Vec::new());
        }
        let prompt = format!(
            "Provide up to {MAX_SUGGESTIONS} city name suggestions for the partial input \
             \"{partial}\". The suggestions should be in the format 'City, State' or \
             'City, Country'."
        );
        let mut result: Suggestions = self
            .generate_json(
                prompt,
                json!({
                    "type": "OBJECT",
                    "properties": {
                        "suggestions": { "type": "ARRAY", "items": { "type": "STRING" } }
                    },
                    "required": ["suggestions"]
                }),
            )
            .await?;
        result.suggestions.truncate(MAX_SUGGESTIONS);
        Ok(result.suggestions)
    }

    async fn generate_image(&self, subject: &str) -> AppResult<String> {
        self.generate_image_part(vec![json!({
            "text": format!("A photorealistic real-estate listing photo of {subject}.")
        })])
        .await
    }

    async fn enhance_image(&self, image_ref: &str) -> AppResult<String> {
        let (mime_type, data) = split_data_url(image_ref).ok_or_else(|| {
            AppError::Remote("only inline generated images can be enhanced".into())
        })?;
        self.generate_image_part(vec![
            json!({ "inlineData": { "mimeType": mime_type, "data": data } }),
            json!({ "text": ENHANCE_INSTRUCTION }),
        ])
        .await
    }
}

/// Parses a model payload, tolerating a surrounding markdown code fence.
fn parse_payload<T: serde::de::DeserializeOwned>(raw: &str) -> AppResult<T> {
    let body = strip_code_fence(raw);
    serde_json::from_str(body).map_err(|err| {
        warn!(?err, "model returned content that is not the requested JSON");
        AppError::MalformedResponse(format!("failed to parse model output: {err}"))
    })
}

/// Decodes rows one at a time so a single badly typed row is dropped rather than
/// failing the whole page. A page where no row decodes is malformed.
fn decode_listing_rows(rows: Vec<Value>) -> AppResult<Vec<Listing>> {
    let total = rows.len();
    let listings: Vec<Listing> = rows
        .into_iter()
        .enumerate()
        .filter_map(|(index, row)| match serde_json::from_value::<Listing>(row) {
            Ok(listing) => Some(listing),
            Err(err) => {
                warn!(?err, row = index, "dropping listing row that does not decode");
                None
            }
        })
        .collect();
    if total > 0 && listings.is_empty() {
        return Err(AppError::MalformedResponse(format!(
            "none of the {total} listing rows could be decoded"
        )));
    }
    Ok(listings)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"));
    match inner {
        Some(rest) => rest.trim_end().strip_suffix("```").unwrap_or(rest).trim(),
        None => trimmed,
    }
}

fn split_data_url(image_ref: &str) -> Option<(&str, &str)> {
    let rest = image_ref.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    if mime_type.is_empty() || data.is_empty() {
        return None;
    }
    Some((mime_type, data))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebChunk>,
}

#[derive(Debug, Deserialize)]
struct WebChunk {
    uri: Option<String>,
    title: Option<String>,
}

impl GenerateResponse {
    fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    fn text(&self) -> AppResult<String> {
        let text: String = self
            .first_candidate()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AppError::MalformedResponse("response had no text".into()));
        }
        Ok(text)
    }

    fn sources(&self) -> Vec<Source> {
        self.first_candidate()
            .and_then(|candidate| candidate.grounding_metadata.as_ref())
            .map(|meta| {
                meta.grounding_chunks
                    .iter()
                    .filter_map(|chunk| chunk.web.as_ref())
                    .filter_map(|web| {
                        web.uri.clone().map(|uri| Source {
                            uri,
                            title: web.title.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
