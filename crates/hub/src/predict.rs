//! Prediction collaborator: a remote model that recommends an irrigation
//! duration and volume from 15 soil/climate features.

use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::{SessionCoordinator, StartOutcome};
use crate::usage::SessionKind;

pub const FEATURE_COUNT: usize = 15;
pub type Features = [f64; FEATURE_COUNT];

/// Air temperature, rainfall, air humidity, wind, crop type, area (m²),
/// soil temperature, soil humidity, EC, pH, N, P, K, fertility, soil type.
pub const DEFAULT_FEATURES: Features = [
    25.0, 2.5, 65.0, 12.0, 1.0, 25000.0, 26.0, 42.0, 1.2, 6.8, 45.0, 38.0, 152.0, 3.0, 2.0,
];

pub const ML_LABEL: &str = "ML_Auto";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub duration_minutes: f64,
    pub volume_m3: f64,
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, features: &Features) -> Result<Prediction>;
}

// ---------------------------------------------------------------------------
// HTTP predictor
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PredictRequest<'a> {
    features: &'a [f64],
}

#[derive(Deserialize)]
struct PredictResponse {
    duree_minutes: f64,
    volume_eau_m3: f64,
    #[serde(default)]
    status: String,
}

pub struct HttpPredictor {
    client: reqwest::Client,
    url: String,
}

impl HttpPredictor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building prediction http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, features: &Features) -> Result<Prediction> {
        let response = self
            .client
            .post(&self.url)
            .json(&PredictRequest { features })
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;

        if !response.status().is_success() {
            bail!("predictor answered {}", response.status());
        }

        let body: PredictResponse = response
            .json()
            .await
            .context("decoding predictor response")?;
        ensure!(body.status == "ok", "predictor status '{}'", body.status);
        ensure!(
            body.duree_minutes.is_finite() && body.duree_minutes > 0.0,
            "predicted duration {} is not usable",
            body.duree_minutes
        );
        ensure!(
            body.volume_eau_m3.is_finite() && body.volume_eau_m3 >= 0.0,
            "predicted volume {} is not usable",
            body.volume_eau_m3
        );

        Ok(Prediction {
            duration_minutes: body.duree_minutes,
            volume_m3: body.volume_eau_m3,
        })
    }
}

// ---------------------------------------------------------------------------
// ML-triggered start
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MlStartOutcome {
    Started {
        session_id: Uuid,
        prediction: Prediction,
    },
    Conflict {
        reason: String,
    },
    PredictionFailed {
        error: String,
    },
    /// No session was created. The prediction is returned so the caller
    /// can retry the start without asking the model again.
    PublishFailed {
        prediction: Prediction,
    },
    InvalidPrediction {
        prediction: Prediction,
        reason: String,
    },
}

/// Ask the model for a duration, then start an `ml` session with it.
pub async fn start_ml_session(
    coordinator: &SessionCoordinator,
    predictor: &dyn Predictor,
    features: &Features,
) -> MlStartOutcome {
    // Checked up front so a busy actuator does not cost a model call.
    let check = coordinator.can_start(SessionKind::Ml);
    if !check.allowed {
        return MlStartOutcome::Conflict {
            reason: check.reason.unwrap_or_default(),
        };
    }

    let prediction = match predictor.predict(features).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "predict: request failed");
            return MlStartOutcome::PredictionFailed {
                error: format!("{e:#}"),
            };
        }
    };
    info!(
        duration_minutes = prediction.duration_minutes,
        volume_m3 = prediction.volume_m3,
        "predict: recommendation received"
    );

    match coordinator
        .start(
            SessionKind::Ml,
            ML_LABEL,
            Some(prediction.duration_minutes),
            Some(prediction.volume_m3),
        )
        .await
    {
        StartOutcome::Started(session_id) => MlStartOutcome::Started {
            session_id,
            prediction,
        },
        StartOutcome::Conflict(reason) => MlStartOutcome::Conflict { reason },
        StartOutcome::PublishFailed => MlStartOutcome::PublishFailed { prediction },
        StartOutcome::InvalidDuration(reason) => {
            MlStartOutcome::InvalidPrediction { prediction, reason }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed predictor (tests)
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
