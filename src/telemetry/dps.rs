use super::sas::{expiry_from_now, generate_sas_token};
use super::{DeviceIdentity, Provisioner};
use crate::config::TelemetryConfig;
use crate::error::{OccucamError, ProvisioningError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

const API_VERSION: &str = "2019-03-31";
const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Device provisioning service client using symmetric-key attestation
pub struct DpsProvisioner {
    client: reqwest::Client,
    base_url: String,
    id_scope: String,
    registration_id: String,
    symmetric_key: String,
    model_id: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOperation {
    #[serde(default)]
    operation_id: Option<String>,
    status: String,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

impl DpsProvisioner {
    pub fn from_config(config: &TelemetryConfig) -> Result<Self> {
        let require = |value: &str, field: &'static str| {
            if value.trim().is_empty() {
                Err(ProvisioningError::MissingSetting { field })
            } else {
                Ok(value.trim().to_string())
            }
        };

        let id_scope = require(&config.id_scope, "telemetry.id_scope")?;
        let registration_id = require(&config.device_id, "telemetry.device_id")?;
        let symmetric_key = require(&config.device_key, "telemetry.device_key")?;

        let endpoint = if config.dps_endpoint.contains("://") {
            config.dps_endpoint.clone()
        } else {
            format!("https://{}", config.dps_endpoint)
        };

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                OccucamError::component("telemetry", &format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            id_scope,
            registration_id,
            symmetric_key,
            model_id: config.model_id.clone(),
            poll_attempts: 10,
            poll_interval: Duration::from_secs(3),
        })
    }

    /// Override how often the registration operation is polled
    pub fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    fn registration_url(&self, suffix: &str) -> String {
        format!(
            "{}/{}/registrations/{}/{}?api-version={}",
            self.base_url, self.id_scope, self.registration_id, suffix, API_VERSION
        )
    }

    fn authorization(&self) -> std::result::Result<String, ProvisioningError> {
        let resource = format!("{}/registrations/{}", self.id_scope, self.registration_id);
        generate_sas_token(
            &resource,
            &self.symmetric_key,
            Some("registration"),
            expiry_from_now(TOKEN_TTL),
        )
    }

    async fn poll_operation(
        &self,
        operation_id: &str,
        authorization: &str,
    ) -> std::result::Result<RegistrationOperation, ProvisioningError> {
        for attempt in 1..=self.poll_attempts {
            sleep(self.poll_interval).await;

            let operation: RegistrationOperation = self
                .client
                .get(self.registration_url(&format!("operations/{}", operation_id)))
                .header(reqwest::header::AUTHORIZATION, authorization)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            debug!(
                "Registration status after poll {}: {}",
                attempt, operation.status
            );
            if operation.status != "assigning" {
                return Ok(operation);
            }
        }

        Err(ProvisioningError::PollingExhausted {
            attempts: self.poll_attempts,
        })
    }
}

#[async_trait]
impl Provisioner for DpsProvisioner {
    async fn register(&self) -> std::result::Result<DeviceIdentity, ProvisioningError> {
        info!("Provisioning device {}", self.registration_id);
        let authorization = self.authorization()?;

        let mut body = json!({ "registrationId": self.registration_id });
        if !self.model_id.is_empty() {
            body["payload"] = json!({ "modelId": self.model_id });
        }

        let mut operation: RegistrationOperation = self
            .client
            .put(self.registration_url("register"))
            .header(reqwest::header::AUTHORIZATION, &authorization)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if operation.status == "assigning" {
            let operation_id = operation.operation_id.clone().unwrap_or_default();
            operation = self.poll_operation(&operation_id, &authorization).await?;
        }

        if operation.status != "assigned" {
            return Err(ProvisioningError::NotAssigned {
                status: operation.status,
            });
        }

        let state = operation.registration_state.unwrap_or(RegistrationState {
            assigned_hub: None,
            device_id: None,
        });
        let assigned_hub = state.assigned_hub.ok_or(ProvisioningError::MissingSetting {
            field: "registrationState.assignedHub",
        })?;
        let device_id = state.device_id.unwrap_or_else(|| self.registration_id.clone());

        info!("Device was assigned to {} as {}", assigned_hub, device_id);
        Ok(DeviceIdentity {
            hub_host: assigned_hub,
            device_id,
            shared_access_key: self.symmetric_key.clone(),
        })
    }
}

#[cfg(all(test, feature = "http-trigger"))]
mod tests {
    use super::*;
    use crate::config::OccucamConfig;
    use axum::extract::State;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct MockDps {
        final_status: &'static str,
        polls: Arc<AtomicUsize>,
    }

    async fn register(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["registrationId"], "cam-1");
        Json(json!({ "operationId": "op-1", "status": "assigning" }))
    }

    async fn operation(State(dps): State<MockDps>) -> Json<Value> {
        dps.polls.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "operationId": "op-1",
            "status": dps.final_status,
            "registrationState": {
                "assignedHub": "hub.example.net",
                "deviceId": "cam-1",
                "status": dps.final_status
            }
        }))
    }

    async fn provisioner(final_status: &'static str) -> (DpsProvisioner, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/scope01/registrations/cam-1/register", put(register))
            .route(
                "/scope01/registrations/cam-1/operations/:operation",
                get(operation),
            )
            .with_state(MockDps {
                final_status,
                polls: Arc::clone(&polls),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut config = OccucamConfig::default().telemetry;
        config.id_scope = "scope01".to_string();
        config.device_id = "cam-1".to_string();
        config.device_key = "b2NjdWNhbS10ZXN0LWtleQ==".to_string();
        config.dps_endpoint = format!("http://{}", address);

        let provisioner = DpsProvisioner::from_config(&config)
            .unwrap()
            .with_polling(3, Duration::from_millis(10));
        (provisioner, polls)
    }

    #[tokio::test]
    async fn test_register_assigned() {
        let (provisioner, polls) = provisioner("assigned").await;
        let identity = provisioner.register().await.unwrap();
        assert_eq!(identity.hub_host, "hub.example.net");
        assert_eq!(identity.device_id, "cam-1");
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_not_assigned() {
        let (provisioner, _) = provisioner("failed").await;
        let result = provisioner.register().await;
        assert!(matches!(
            result,
            Err(ProvisioningError::NotAssigned { status }) if status == "failed"
        ));
    }

    #[tokio::test]
    async fn test_register_polling_exhausted() {
        let (provisioner, polls) = provisioner("assigning").await;
        let result = provisioner.register().await;
        assert!(matches!(
            result,
            Err(ProvisioningError::PollingExhausted { attempts: 3 })
        ));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_missing_settings() {
        let config = OccucamConfig::default().telemetry;
        assert!(DpsProvisioner::from_config(&config).is_err());
    }
}
