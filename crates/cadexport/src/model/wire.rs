//! JSON text framing shared by the subscriber endpoint and the sync client.
//!
//! Every frame is an object with a `type` discriminator, an optional `data`
//! payload and an optional `id`:
//!
//! ```text
//! {"type":"initial","data":[...jobs]}
//! {"type":"INSERT","data":{...job}}
//! {"type":"UPDATE","data":{...job}}
//! {"type":"DELETE","id":"..."}
//! {"type":"subscribe","table":"jobs"}
//! ```

use serde::{Deserialize, Serialize};

use super::{ChangeEvent, Job};

pub const TYPE_INITIAL: &str = "initial";
pub const TYPE_INSERT: &str = "INSERT";
pub const TYPE_UPDATE: &str = "UPDATE";
pub const TYPE_DELETE: &str = "DELETE";
pub const TYPE_SUBSCRIBE: &str = "subscribe";

/// Name of the collection subscribers ask for.
pub const JOBS_TABLE: &str = "jobs";

/// Raw frame as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

impl WireMessage {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data: None,
            id: None,
            table: None,
        }
    }

    pub fn initial(jobs: &[Job]) -> Result<Self, serde_json::Error> {
        let mut msg = Self::new(TYPE_INITIAL);
        msg.data = Some(serde_json::to_value(jobs)?);
        Ok(msg)
    }

    pub fn from_event(event: &ChangeEvent) -> Result<Self, serde_json::Error> {
        let msg = match event {
            ChangeEvent::Insert(job) => {
                let mut msg = Self::new(TYPE_INSERT);
                msg.data = Some(serde_json::to_value(job)?);
                msg
            }
            ChangeEvent::Update(job) => {
                let mut msg = Self::new(TYPE_UPDATE);
                msg.data = Some(serde_json::to_value(job)?);
                msg
            }
            ChangeEvent::Delete(id) => {
                let mut msg = Self::new(TYPE_DELETE);
                msg.id = Some(id.clone());
                msg
            }
        };
        Ok(msg)
    }

    pub fn subscribe() -> Self {
        let mut msg = Self::new(TYPE_SUBSCRIBE);
        msg.table = Some(JOBS_TABLE.to_string());
        msg
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Initial(Vec<Job>),
    Insert(Job),
    Update(Job),
    Delete(String),
    Subscribe,
    Unknown(String),
}

impl Incoming {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let msg: WireMessage = serde_json::from_str(text)?;
        let data = msg.data.unwrap_or(serde_json::Value::Null);
        let incoming = match msg.kind.as_str() {
            TYPE_INITIAL => Incoming::Initial(serde_json::from_value(data)?),
            TYPE_INSERT => Incoming::Insert(serde_json::from_value(data)?),
            TYPE_UPDATE => Incoming::Update(serde_json::from_value(data)?),
            TYPE_DELETE => match msg.id {
                Some(id) => Incoming::Delete(id),
                // Some producers put the deleted record in `data` instead.
                None => {
                    let job: Job = serde_json::from_value(data)?;
                    Incoming::Delete(job.id)
                }
            },
            TYPE_SUBSCRIBE => Incoming::Subscribe,
            other => Incoming::Unknown(other.to_string()),
        };
        Ok(incoming)
    }
}
