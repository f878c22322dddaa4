use log::debug;
use serde::Serialize;

/// Client for the backend device-command endpoint. Commands are
/// fire-and-forget: the device answers (if at all) through the push channel,
/// never through this response.
#[derive(Debug, Clone)]
pub struct CommandApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    path: &'a str,
    value: &'a str,
}

impl CommandApi {
    pub fn new(base_url: &str) -> Self {
        CommandApi {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Ask a device to announce itself. The answer, if the device is alive,
    /// arrives on its `answerInfo` topic.
    pub async fn ask_info(&self, device_id: &str) -> Result<(), reqwest::Error> {
        self.dispatch(device_id, "askInfo", "hi").await
    }

    /// Send an actuation command (e.g. toggle a relay pin). The result is not
    /// correlated back into presence tracking.
    pub async fn dispatch(
        &self,
        device_id: &str,
        path: &str,
        value: &str,
    ) -> Result<(), reqwest::Error> {
        debug!("Dispatching {}={} to device {}", path, value, device_id);
        self.http
            .post(format!("{}/command", self.base_url))
            .json(&CommandRequest {
                device_id,
                path,
                value,
            })
            .send()
            .await?;
        Ok(())
    }
}
