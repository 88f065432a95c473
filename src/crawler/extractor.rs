//! Record extraction
//!
//! Turns one fetched body into records plus continuation targets. Two page
//! formats are supported:
//! - `c2c-api`: the camptocamp.org document API (JSON listings and details)
//! - `html`: listing pages described by CSS selectors
//!
//! Extraction is a pure function of the target and the body. A candidate
//! missing a required field is skipped and reported; a body that cannot be
//! read at all fails the whole page.

use crate::config::{compile_selector, Config, SourceConfig, SourceFormat};
use crate::crawler::{identity_for, Cursor, Record, Target};
use crate::url::{api_root, extract_host, host_allowed};
use crate::{ConfigError, ExtractionError};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use url::Url;

/// Everything a page yielded
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<Record>,

    /// Continuation targets (next pages, associated details)
    pub targets: Vec<Target>,

    /// Candidates dropped because of missing fields
    pub skipped: Vec<ExtractionError>,
}

/// Compiled HTML extraction rules
#[derive(Debug)]
struct HtmlRules {
    listing: Selector,
    id_attribute: String,
    next: Option<Selector>,
    fields: Vec<(String, Selector)>,
}

#[derive(Debug)]
enum Format {
    C2cApi,
    Html(HtmlRules),
}

/// Extractor for one configured source
#[derive(Debug)]
pub struct Extractor {
    format: Format,
    max_depth: u32,
    page_size: u32,
    follow_associations: bool,
    preferred_lang: String,
    /// Host patterns continuation links may point to
    allowed_hosts: Vec<String>,
}

impl Extractor {
    /// Compiles the extraction rules of a source
    ///
    /// # Arguments
    ///
    /// * `source` - The source configuration
    /// * `max_depth` - Continuation targets deeper than this are never produced
    ///
    /// # Returns
    ///
    /// * `Ok(Extractor)` - Ready to extract
    /// * `Err(ConfigError)` - A selector failed to compile or the html table is missing
    pub fn new(source: &SourceConfig, max_depth: u32) -> Result<Self, ConfigError> {
        let format = match source.format {
            SourceFormat::C2cApi => Format::C2cApi,
            SourceFormat::Html => {
                let html = source.html.as_ref().ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "source '{}' uses format \"html\" but has no [source.html] table",
                        source.name
                    ))
                })?;

                Format::Html(HtmlRules {
                    listing: compile_selector(&html.listing)?,
                    id_attribute: html.id_attribute.clone(),
                    next: html.next.as_deref().map(compile_selector).transpose()?,
                    fields: html
                        .fields
                        .iter()
                        .map(|(name, selector)| Ok((name.clone(), compile_selector(selector)?)))
                        .collect::<Result<_, ConfigError>>()?,
                })
            }
        };

        let allowed_hosts = if source.allowed_hosts.is_empty() {
            source
                .seeds
                .iter()
                .filter_map(|seed| Url::parse(seed).ok())
                .filter_map(|url| extract_host(&url))
                .collect()
        } else {
            source.allowed_hosts.clone()
        };

        Ok(Self {
            format,
            max_depth,
            page_size: source.page_size,
            follow_associations: source.follow_associations,
            preferred_lang: source.preferred_lang.clone(),
            allowed_hosts,
        })
    }

    /// Extracts records and continuation targets from a page body
    ///
    /// # Arguments
    ///
    /// * `target` - The target the body was fetched for
    /// * `body` - The response body
    /// * `observed_at` - Timestamp stored on every record
    ///
    /// # Returns
    ///
    /// * `Ok(Extraction)` - Records, targets and skipped candidates
    /// * `Err(ExtractionError)` - The body as a whole is unusable
    pub fn extract(
        &self,
        target: &Target,
        body: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Extraction, ExtractionError> {
        match &self.format {
            Format::C2cApi => self.extract_api(target, body, observed_at),
            Format::Html(rules) => Ok(self.extract_html(rules, target, body, observed_at)),
        }
    }

    fn can_descend(&self, target: &Target) -> bool {
        target.depth < self.max_depth
    }

    fn extract_api(
        &self,
        target: &Target,
        body: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Extraction, ExtractionError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;
        let Value::Object(page) = value else {
            return Err(ExtractionError::UnexpectedShape(
                "expected a JSON object".to_string(),
            ));
        };

        let kind = target.kind();
        let mut extraction = Extraction::default();

        if let Some(documents) = page.get("documents") {
            let documents = documents.as_array().ok_or_else(|| {
                ExtractionError::UnexpectedShape("'documents' is not an array".to_string())
            })?;

            let mut followed = HashSet::new();
            for (index, document) in documents.iter().enumerate() {
                match self.project_document(target, &kind, index, document, observed_at) {
                    Ok(record) => {
                        self.follow_routes(target, &record, &mut followed, &mut extraction.targets);
                        extraction.records.push(record);
                    }
                    Err(e) => extraction.skipped.push(e),
                }
            }

            if let Some(next) = self.next_page(target, &page, documents.len()) {
                extraction.targets.push(next);
            }
        } else if page.contains_key("document_id") {
            let record = self.project_document(target, &kind, 0, &Value::Object(page), observed_at)?;
            self.follow_routes(target, &record, &mut HashSet::new(), &mut extraction.targets);
            extraction.records.push(record);
        } else {
            return Err(ExtractionError::UnexpectedShape(
                "neither a listing nor a document".to_string(),
            ));
        }

        Ok(extraction)
    }

    /// Next listing page, if there is one and it is not too deep
    ///
    /// Without a `total` the listing continues while pages come back full.
    fn next_page(&self, target: &Target, page: &Map<String, Value>, returned: usize) -> Option<Target> {
        if !self.can_descend(target) {
            return None;
        }

        let cursor = target.cursor.unwrap_or(Cursor {
            offset: 0,
            limit: self.page_size,
        });
        let next_offset = cursor.offset + u64::from(cursor.limit);

        let has_more = match page.get("total").and_then(Value::as_u64) {
            Some(total) => next_offset < total,
            None => returned > 0 && returned == cursor.limit as usize,
        };

        has_more.then(|| {
            target.follow(
                target.url.clone(),
                Some(Cursor {
                    offset: next_offset,
                    limit: cursor.limit,
                }),
            )
        })
    }

    fn project_document(
        &self,
        target: &Target,
        kind: &str,
        index: usize,
        document: &Value,
        observed_at: DateTime<Utc>,
    ) -> Result<Record, ExtractionError> {
        let missing = |field: &str| ExtractionError::MissingField {
            index,
            field: field.to_string(),
        };

        let document = document.as_object().ok_or_else(|| missing("document_id"))?;
        let document_id = document
            .get("document_id")
            .and_then(id_string)
            .ok_or_else(|| missing("document_id"))?;

        let fields = match kind {
            "routes" => self.route_fields(document),
            "outings" => {
                if document.get("date_start").map_or(true, Value::is_null) {
                    return Err(missing("date_start"));
                }
                outing_fields(document)
            }
            _ => document.clone(),
        };

        Ok(Record::new(target, kind, &document_id, fields, observed_at))
    }

    fn route_fields(&self, document: &Map<String, Value>) -> Map<String, Value> {
        let mut fields = Map::new();

        fields.insert(
            "title".to_string(),
            self.title(document).map_or(Value::Null, Value::String),
        );

        let (lon, lat) = coordinates(document);
        fields.insert("lon".to_string(), lon);
        fields.insert("lat".to_string(), lat);

        let activities: Vec<&str> = document
            .get("activities")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for activity in ["snow_ice_mixed", "mountain_climbing", "ice_climbing"] {
            fields.insert(activity.to_string(), Value::Bool(activities.contains(&activity)));
        }
        fields.insert(
            "activities".to_string(),
            Value::Array(activities.iter().map(|a| Value::String(a.to_string())).collect()),
        );

        for key in [
            "elevation_min",
            "elevation_max",
            "difficulties_height",
            "height_diff_difficulties",
            "glacier_gear",
            "global_rating",
            "ice_rating",
            "mixed_rating",
            "rock_free_rating",
        ] {
            fields.insert(key.to_string(), copy_field(document, key));
        }

        fields.insert(
            "orientations".to_string(),
            match document.get("orientations") {
                Some(Value::Array(list)) => Value::Array(list.clone()),
                _ => Value::Array(Vec::new()),
            },
        );

        fields.insert("countries".to_string(), Value::Array(self.countries(document)));
        fields
    }

    /// Title in the preferred language, else the first titled locale
    fn title(&self, document: &Map<String, Value>) -> Option<String> {
        let locales = document.get("locales")?.as_array()?;
        let titled = |locale: &&Value| {
            locale
                .get("title")
                .and_then(Value::as_str)
                .map_or(false, |t| !t.is_empty())
        };

        let locale = locales
            .iter()
            .filter(titled)
            .find(|l| l.get("lang").and_then(Value::as_str) == Some(self.preferred_lang.as_str()))
            .or_else(|| locales.iter().find(titled))?;

        let title = locale.get("title").and_then(Value::as_str)?;
        Some(match locale.get("title_prefix").and_then(Value::as_str) {
            Some(prefix) if !prefix.is_empty() => format!("{} : {}", prefix, title),
            _ => title.to_string(),
        })
    }

    /// Areas of type `country` as `{countryId, countryName}`
    fn countries(&self, document: &Map<String, Value>) -> Vec<Value> {
        let Some(areas) = document.get("areas").and_then(Value::as_array) else {
            return Vec::new();
        };

        areas
            .iter()
            .filter(|area| area.get("area_type").and_then(Value::as_str) == Some("country"))
            .filter_map(|area| {
                let id = area.get("document_id")?.clone();
                let name = area
                    .get("locales")
                    .and_then(Value::as_array)
                    .and_then(|locales| {
                        locales.iter().find(|l| {
                            l.get("lang").and_then(Value::as_str) == Some(self.preferred_lang.as_str())
                        })
                    })
                    .and_then(|l| l.get("title"))
                    .cloned()
                    .unwrap_or(Value::Null);

                let mut country = Map::new();
                country.insert("countryId".to_string(), id);
                country.insert("countryName".to_string(), name);
                Some(Value::Object(country))
            })
            .collect()
    }

    /// Queues detail targets for the routes of an outing
    fn follow_routes(
        &self,
        target: &Target,
        record: &Record,
        seen: &mut HashSet<String>,
        targets: &mut Vec<Target>,
    ) {
        if !self.follow_associations || record.kind != "outings" || !self.can_descend(target) {
            return;
        }
        let Some(Value::Array(routes)) = record.fields.get("routes") else {
            return;
        };

        let root = api_root(&target.url);
        let host = target.host().unwrap_or_default();

        for id in routes.iter().filter_map(id_string) {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Ok(url) = root.join(&format!("routes/{}", id)) else {
                continue;
            };
            targets.push(
                target
                    .follow(url, None)
                    .with_identity_hint(identity_for(&host, "routes", &id)),
            );
        }
    }

    fn extract_html(
        &self,
        rules: &HtmlRules,
        target: &Target,
        body: &str,
        observed_at: DateTime<Utc>,
    ) -> Extraction {
        let document = Html::parse_document(body);
        // Listing ids are scoped by source, not by the page they appear on
        let kind = target.source.as_str();
        let mut extraction = Extraction::default();

        for (index, element) in document.select(&rules.listing).enumerate() {
            let id = element
                .value()
                .attr(&rules.id_attribute)
                .map(str::trim)
                .filter(|id| !id.is_empty());

            let Some(id) = id else {
                extraction.skipped.push(ExtractionError::MissingField {
                    index,
                    field: rules.id_attribute.clone(),
                });
                continue;
            };

            let fields = rules
                .fields
                .iter()
                .map(|(name, selector)| (name.clone(), element_text(element, selector)))
                .collect();

            extraction
                .records
                .push(Record::new(target, kind, id, fields, observed_at));
        }

        if let Some(next) = self.next_link(rules, target, &document) {
            extraction.targets.push(next);
        }

        extraction
    }

    fn next_link(&self, rules: &HtmlRules, target: &Target, document: &Html) -> Option<Target> {
        if !self.can_descend(target) {
            return None;
        }

        let href = document
            .select(rules.next.as_ref()?)
            .next()?
            .value()
            .attr("href")?
            .trim();

        let url = target.request_url().join(href).ok()?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return None;
        }

        let host = extract_host(&url)?;
        if !host_allowed(&self.allowed_hosts, &host) {
            tracing::debug!(url = %url, "Next link leaves the source, ignoring");
            return None;
        }

        Some(target.follow(url, None))
    }
}

/// Extractors of every configured source, keyed by source name
#[derive(Debug, Default)]
pub struct Extractors {
    by_source: HashMap<String, Extractor>,
}

impl Extractors {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let by_source = config
            .sources
            .iter()
            .map(|source| {
                Ok((
                    source.name.clone(),
                    Extractor::new(source, config.crawler.max_depth)?,
                ))
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { by_source })
    }

    /// Extracts with the extractor of the target's source
    pub fn extract(
        &self,
        target: &Target,
        body: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Extraction, ExtractionError> {
        self.by_source
            .get(&target.source)
            .ok_or_else(|| ExtractionError::UnknownSource(target.source.clone()))?
            .extract(target, body, observed_at)
    }
}

fn outing_fields(document: &Map<String, Value>) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("date_start".to_string(), copy_field(document, "date_start"));
    fields.insert(
        "condition_rating".to_string(),
        copy_field(document, "condition_rating"),
    );

    let routes = document
        .get("associations")
        .and_then(|a| a.get("routes"))
        .and_then(Value::as_array)
        .map(|routes| {
            routes
                .iter()
                .filter_map(|r| r.get("document_id").cloned())
                .collect()
        })
        .unwrap_or_default();
    fields.insert("routes".to_string(), Value::Array(routes));
    fields
}

/// `[lon, lat]` from the GeoJSON string in `geometry.geom`, in source projection
fn coordinates(document: &Map<String, Value>) -> (Value, Value) {
    let coords = document
        .get("geometry")
        .and_then(|g| g.get("geom"))
        .and_then(Value::as_str)
        .and_then(|geom| serde_json::from_str::<Value>(geom).ok())
        .and_then(|geom| geom.get("coordinates").cloned());

    match coords {
        Some(Value::Array(pair)) if pair.len() >= 2 => (pair[0].clone(), pair[1].clone()),
        _ => (Value::Null, Value::Null),
    }
}

fn copy_field(document: &Map<String, Value>, key: &str) -> Value {
    document.get(key).cloned().unwrap_or(Value::Null)
}

/// Document ids come as numbers from the API but may be strings elsewhere
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn element_text(element: ElementRef<'_>, selector: &Selector) -> Value {
    element
        .select(selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .map_or(Value::Null, Value::String)
}
