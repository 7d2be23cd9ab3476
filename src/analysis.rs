//
// analysis.rs
// MedImg-Pipeline
//
// Natural-language analysis of segmentation results through a text-generation API, with
// rate-limit backoff and timeout retries, plus the small amount of context assembly the
// prompts need.
//
// Thales Matheus Mendonça Santos - November 2025

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::lifecycle::StudyStatus;
use crate::models::{AnalysisReport, SegmentationManifest, SegmentationOutcome};

/// Nominal confidence attached to every generated report.
pub const ANALYSIS_CONFIDENCE: f64 = 0.8;
const CONTEXT_ORGAN_LIMIT: usize = 20;
const DISCLAIMER: &str =
    "Note: This is for educational/research purposes and should not replace professional medical diagnosis.";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl From<&AnalysisConfig> for GenerationParams {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            max_output_tokens: config.max_output_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationParams,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

/// Raw HTTP outcome as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Delivers one JSON request body to the generation endpoint.
pub trait GenerationTransport: Send + Sync {
    fn post(
        &self,
        body: &serde_json::Value,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

/// `reqwest`-backed transport; the key travels as the `key` query parameter.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AnalysisError::Client("no API key configured".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AnalysisError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: config.api_url.clone(),
            api_key,
        })
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(err.to_string())
    }
}

impl GenerationTransport for HttpTransport {
    async fn post(&self, body: &serde_json::Value) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .post(&self.url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        Ok(TransportResponse { status, body })
    }
}

pub struct AnalysisClient<X: GenerationTransport = HttpTransport> {
    transport: X,
    model: String,
    max_attempts: u32,
    retry_delay: Duration,
    params: GenerationParams,
}

impl AnalysisClient<HttpTransport> {
    /// `None` when no API key is configured.
    pub fn from_config(config: &AnalysisConfig) -> Result<Option<Self>, AnalysisError> {
        if !config.is_configured() {
            return Ok(None);
        }
        Ok(Some(Self::new(HttpTransport::new(config)?, config)))
    }
}

impl<X: GenerationTransport> AnalysisClient<X> {
    pub fn new(transport: X, config: &AnalysisConfig) -> Self {
        Self {
            transport,
            model: config.model.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            params: GenerationParams::from(config),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send `prompt`, retrying rate limits with exponential backoff and transport failures
    /// with the fixed delay. Other error statuses end the request immediately.
    pub async fn request(&self, prompt: &str) -> Result<AnalysisReport, AnalysisError> {
        let body = serde_json::to_value(GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            generation_config: self.params,
        })
        .map_err(|e| AnalysisError::Client(e.to_string()))?;

        let mut last_failure = String::new();
        for attempt in 0..self.max_attempts {
            let wait = match self.transport.post(&body).await {
                Ok(resp) if resp.status == 200 => return self.report(prompt, &resp.body),
                Ok(resp) if resp.status == 429 => {
                    last_failure = "rate limited (429)".to_string();
                    self.retry_delay.saturating_mul(1u32 << attempt.min(16))
                }
                Ok(resp) => {
                    error!(status = resp.status, "text-generation API error");
                    return Err(AnalysisError::Api {
                        status: resp.status,
                        body: resp.body,
                    });
                }
                Err(err) => {
                    last_failure = err.to_string();
                    self.retry_delay
                }
            };

            if attempt + 1 < self.max_attempts {
                warn!(
                    attempt = attempt + 1,
                    wait_ms = wait.as_millis() as u64,
                    reason = %last_failure,
                    "retrying text-generation request"
                );
                tokio::time::sleep(wait).await;
            }
        }

        error!(attempts = self.max_attempts, reason = %last_failure, "text-generation retries exhausted");
        Err(AnalysisError::RetriesExhausted {
            attempts: self.max_attempts,
            last: last_failure,
        })
    }

    fn report(&self, prompt: &str, body: &str) -> Result<AnalysisReport, AnalysisError> {
        let parsed: GenerateResponse =
            serde_json::from_str(body).map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or_else(|| AnalysisError::InvalidResponse("no candidate text".to_string()))?;

        debug!(chars = text.len(), "text-generation response received");
        Ok(AnalysisReport {
            prompt_tokens: prompt.split_whitespace().count(),
            completion_tokens: text.split_whitespace().count(),
            text,
            confidence: ANALYSIS_CONFIDENCE,
            model: self.model.clone(),
            timestamp: Utc::now(),
        })
    }

    /// General or request-specific analysis of a segmentation manifest.
    pub async fn analyze_segmentation(
        &self,
        manifest: &SegmentationManifest,
        request: Option<&str>,
    ) -> Result<AnalysisReport, AnalysisError> {
        let prompt = analysis_prompt(&segmentation_context(Some(manifest)), request);
        self.request(&prompt).await
    }

    /// Free-form question about a study.
    pub async fn process_query(
        &self,
        query: &str,
        study: Option<&StudyContext>,
        analysis: Option<&SegmentationOutcome>,
    ) -> Result<AnalysisReport, AnalysisError> {
        let prompt = query_prompt(query, &study_context(study, analysis));
        self.request(&prompt).await
    }

    /// Round-trip a trivial prompt to check the key and endpoint.
    pub async fn verify_key(&self) -> Result<(), AnalysisError> {
        self.request("Hello, please respond with 'API test successful' if you can read this.")
            .await
            .map(|_| ())
    }
}

/// Study facts supplied at upload time, used to ground free-form queries.
#[derive(Debug, Clone, Serialize)]
pub struct StudyContext {
    pub patient_id: String,
    pub study_id: String,
    pub modality: String,
    pub study_date: String,
    pub description: Option<String>,
    pub processing_status: StudyStatus,
}

pub fn segmentation_context(manifest: Option<&SegmentationManifest>) -> String {
    let Some(manifest) = manifest else {
        return "No segmentation data available.".to_string();
    };

    let mut lines = vec![format!("Analysis Date: {}", manifest.timestamp.to_rfc3339())];
    let organs = &manifest.segmented_organs;
    if !organs.is_empty() {
        let shown: Vec<&str> = organs
            .iter()
            .take(CONTEXT_ORGAN_LIMIT)
            .map(String::as_str)
            .collect();
        lines.push(format!(
            "Segmented Organs/Structures ({}): {}",
            organs.len(),
            shown.join(", ")
        ));
        if organs.len() > CONTEXT_ORGAN_LIMIT {
            lines.push(format!(
                "... and {} more structures",
                organs.len() - CONTEXT_ORGAN_LIMIT
            ));
        }
    }
    lines.push(format!(
        "Total Structures Identified: {}",
        manifest.summary.total_organs
    ));
    if manifest.is_mock {
        lines.push("Note: This is mock/demonstration data for development purposes.".to_string());
    }
    lines.join("\n")
}

pub fn study_context(study: Option<&StudyContext>, analysis: Option<&SegmentationOutcome>) -> String {
    let mut lines = Vec::new();
    if let Some(study) = study {
        lines.push(format!("Patient ID: {}", study.patient_id));
        lines.push(format!("Study ID: {}", study.study_id));
        lines.push(format!("Modality: {}", study.modality));
        lines.push(format!("Study Date: {}", study.study_date));
        if let Some(description) = study.description.as_deref().filter(|d| !d.is_empty()) {
            lines.push(format!("Description: {description}"));
        }
        lines.push(format!("Processing Status: {}", study.processing_status));
    }
    if let Some(outcome) = analysis {
        lines.push("Analysis Type: segmentation".to_string());
        lines.push(format!("Confidence Score: {:.2}", outcome.confidence));
        lines.push(format!(
            "Analysis Results: {} structures segmented, Total organs: {}",
            outcome.manifest.segmented_organs.len(),
            outcome.manifest.summary.total_organs
        ));
    }
    if lines.is_empty() {
        "Limited study information available.".to_string()
    } else {
        lines.join("\n")
    }
}

pub fn analysis_prompt(context: &str, request: Option<&str>) -> String {
    match request.map(str::trim).filter(|r| !r.is_empty()) {
        Some(request) => format!(
            "As a medical AI assistant, analyze the following medical image segmentation results \
             and respond to this specific request: \"{request}\"\n\n\
             Segmentation Results:\n{context}\n\n\
             Please provide a detailed analysis addressing the specific request while considering \
             the segmentation findings."
        ),
        None => format!(
            "As a medical AI assistant, provide a comprehensive analysis of the following medical \
             image segmentation results:\n\n\
             Segmentation Results:\n{context}\n\n\
             Please provide:\n\
             1. Summary of segmented organs/structures\n\
             2. Notable findings or observations\n\
             3. Potential clinical relevance\n\
             4. Recommendations for further evaluation if needed\n\n\
             {DISCLAIMER}"
        ),
    }
}

pub fn query_prompt(query: &str, context: &str) -> String {
    format!(
        "As a medical AI assistant, answer the following question about this medical imaging study:\n\n\
         Query: \"{query}\"\n\n\
         Study Context:\n{context}\n\n\
         Please provide a helpful and informative response. If the query cannot be answered based \
         on the available information, clearly state what additional information would be needed.\n\n\
         {DISCLAIMER}"
    )
}
