use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub channel: ChannelConfig,
    pub api: ApiConfig,
    pub presence: Option<PresenceConfig>,
    pub log: Option<LogConfig>,
    pub devices: Option<Vec<RelayDevice>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
}

impl ChannelConfig {
    pub fn keep_alive_seconds(&self) -> u64 {
        self.keep_alive_seconds.unwrap_or(60)
    }

    pub fn reconnect_delay_seconds(&self) -> u64 {
        self.reconnect_delay_seconds.unwrap_or(3)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PresenceConfig {
    pub answer_timeout_ms: Option<u64>,
}

impl PresenceConfig {
    pub fn answer_timeout_ms(&self) -> u64 {
        self.answer_timeout_ms.unwrap_or(4000)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct LogConfig {
    pub capacity: Option<usize>,
}

impl LogConfig {
    pub fn capacity(&self) -> usize {
        self.capacity.unwrap_or(512)
    }
}

#[allow(dead_code)]
#[derive(Deserialize, Debug, Clone)]
pub struct RelayDevice {
    pub id: String,
    pub model: String,
    pub name: Option<String>,
}
