// Status frame schema and the injected process-identity capability.
use serde::Serialize;

/// Facts about the running process, injected at construction so the core
/// stays free of process-wide lookups.
pub trait StatusSource: Send {
    fn server_id(&self) -> String;
    fn server_name(&self) -> String;
    fn server_version(&self) -> String;
    fn hostname(&self) -> String;
    fn username(&self) -> String;
    fn process_name(&self) -> String;
    fn pid(&self) -> u32;
    /// Current UTC wall-clock time, `YYYY-MM-DDTHH:MM:SS`.
    fn timestamp_utc(&self) -> String;
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Dest")]
    pub dest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Login")]
    pub login: String,
    #[serde(rename = "Time")]
    pub time: String,
    #[serde(rename = "Subscriptions")]
    pub subscriptions: Vec<SubscriptionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    #[serde(rename = "Dest")]
    pub dest: String,
    #[serde(rename = "MessageCount")]
    pub message_count: usize,
    #[serde(rename = "TotalCount")]
    pub total_count: i64,
    #[serde(rename = "CurrentCount")]
    pub current_count: i64,
    #[serde(rename = "SubscriptionCount")]
    pub subscription_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStatus {
    #[serde(rename = "Dest")]
    pub dest: String,
    #[serde(rename = "TotalCount")]
    pub total_count: i64,
    #[serde(rename = "CurrentCount")]
    pub current_count: i64,
    #[serde(rename = "SubscriptionCount")]
    pub subscription_count: usize,
}

/// Body of the periodic status frame published to the status topic.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(rename = "Clients")]
    pub clients: Vec<ClientStatus>,
    #[serde(rename = "Queues")]
    pub queues: Vec<QueueStatus>,
    #[serde(rename = "Topics")]
    pub topics: Vec<TopicStatus>,
    #[serde(rename = "utc")]
    pub time: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
    pub subtype: String,
    pub subsystem: String,
    #[serde(rename = "computer")]
    pub computer_name: String,
    #[serde(rename = "user")]
    pub user_name: String,
    #[serde(rename = "process")]
    pub process_name: String,
    pub version: String,
    pub pid: u32,
    pub tid: u32,
    pub severity: u32,
    pub message: String,
    #[serde(rename = "enqueueCount")]
    pub enqueue_count: u64,
    #[serde(rename = "requeueCount")]
    pub requeue_count: u64,
    #[serde(rename = "connectCount")]
    pub connect_count: u64,
    #[serde(rename = "disconnectCount")]
    pub disconnect_count: u64,
    #[serde(rename = "currentEnqueueCount")]
    pub current_enqueue_count: u64,
    #[serde(rename = "currentRequeueCount")]
    pub current_requeue_count: u64,
    #[serde(rename = "currentConnectCount")]
    pub current_connect_count: u64,
    #[serde(rename = "currentDisconnectCount")]
    pub current_disconnect_count: u64,
    #[serde(rename = "totalCurrentCount")]
    pub total_current_count: i64,
    #[serde(rename = "totalQueueCount")]
    pub total_queue_count: usize,
    #[serde(rename = "messageRate")]
    pub message_rate: f64,
}

/// Severity used on periodic status frames, from the original status schema.
pub const STATUS_SEVERITY: u32 = 20;
