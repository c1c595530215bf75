use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;

use super::{
    CandidateList, RecordField, RecordId, SessionRecord, SignalingError, SignalingStore,
    Subscription,
};
use crate::transport::{IceCandidateBlob, SessionDescription};

const CREATED_AT_FIELD: &str = "created_at";

/// Writes a description field only while the record hash exists. Returns -1 when the record is
/// gone, 0 when the field was already set, 1 when written.
const SET_FIELD_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
return redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2])
";

/// Appends to a candidate list only while the record hash exists, refreshing the list's TTL.
const APPEND_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return 1
";

fn script_outcome(
    code: i64,
    id: &RecordId,
    field: Option<RecordField>,
) -> Result<(), SignalingError> {
    match (code, field) {
        (-1, _) => Err(SignalingError::NotFound(id.clone())),
        (0, Some(field)) => Err(SignalingError::FieldAlreadySet(field)),
        _ => Ok(()),
    }
}

fn record_key(id: &RecordId) -> String {
    format!("chat:{}", id)
}

fn list_key(id: &RecordId, list: CandidateList) -> String {
    format!("chat:{}:{}", id, list.as_str())
}

/// Builds a record from the hash stored at `chat:{id}`. An empty hash means no record.
fn parse_record(
    id: &RecordId,
    fields: &HashMap<String, String>,
) -> Result<Option<SessionRecord>, SignalingError> {
    if fields.is_empty() {
        return Ok(None);
    }
    let decode = |field: RecordField| -> Result<Option<SessionDescription>, SignalingError> {
        fields
            .get(field.as_str())
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(SignalingError::from)
    };
    Ok(Some(SessionRecord {
        id: id.clone(),
        offer: decode(RecordField::Offer)?,
        answer: decode(RecordField::Answer)?,
    }))
}

/// Signaling records kept in Redis: one hash per record plus a list per candidate direction.
/// Subscriptions poll, since keyspace notifications are often disabled on shared instances.
#[derive(Clone)]
pub struct RedisSignalingStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
    poll_interval: Duration,
}

impl RedisSignalingStore {
    pub async fn connect(
        redis_url: &str,
        ttl_seconds: u64,
        poll_interval: Duration,
    ) -> Result<Self, SignalingError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            ttl_seconds,
            poll_interval,
        })
    }

    fn ttl(&self) -> i64 {
        i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)
    }

    async fn require_record(&self, id: &RecordId) -> Result<(), SignalingError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(record_key(id)).await?;
        if exists {
            Ok(())
        } else {
            Err(SignalingError::NotFound(id.clone()))
        }
    }
}

async fn fetch_record(
    conn: &mut ConnectionManager,
    id: &RecordId,
) -> Result<Option<SessionRecord>, SignalingError> {
    let fields: HashMap<String, String> = conn.hgetall(record_key(id)).await?;
    parse_record(id, &fields)
}

#[async_trait]
impl SignalingStore for RedisSignalingStore {
    async fn create_record(&self) -> Result<RecordId, SignalingError> {
        let mut conn = self.redis.clone();
        let id = RecordId::generate();
        let key = record_key(&id);
        redis::pipe()
            .atomic()
            .hset(&key, CREATED_AT_FIELD, chrono::Utc::now().timestamp())
            .ignore()
            .expire(&key, self.ttl())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        tracing::debug!(target = "signaling", session_id = %id, "created record");
        Ok(id)
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<SessionRecord>, SignalingError> {
        let mut conn = self.redis.clone();
        fetch_record(&mut conn, id).await
    }

    async fn set_field(
        &self,
        id: &RecordId,
        field: RecordField,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(&description)?;
        let code: i64 = Script::new(SET_FIELD_SCRIPT)
            .key(record_key(id))
            .arg(field.as_str())
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        script_outcome(code, id, Some(field))?;
        tracing::trace!(target = "signaling", session_id = %id, field = field.as_str(), "field written");
        Ok(())
    }

    async fn append_to_list(
        &self,
        id: &RecordId,
        list: CandidateList,
        candidate: IceCandidateBlob,
    ) -> Result<(), SignalingError> {
        let mut conn = self.redis.clone();
        let payload = serde_json::to_string(&candidate)?;
        let code: i64 = Script::new(APPEND_SCRIPT)
            .key(record_key(id))
            .key(list_key(id, list))
            .arg(payload)
            .arg(self.ttl())
            .invoke_async(&mut conn)
            .await?;
        script_outcome(code, id, None)
    }

    async fn subscribe_record(
        &self,
        id: &RecordId,
    ) -> Result<Subscription<Option<SessionRecord>>, SignalingError> {
        let mut conn = self.redis.clone();
        let initial = fetch_record(&mut conn, id)
            .await?
            .ok_or_else(|| SignalingError::NotFound(id.clone()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(Some(initial.clone())));

        let id = id.clone();
        let poll_interval = self.poll_interval;
        let forwarder = tokio::spawn(async move {
            let mut last = Some(initial);
            loop {
                tokio::time::sleep(poll_interval).await;
                if tx.is_closed() {
                    break;
                }
                match fetch_record(&mut conn, &id).await {
                    Ok(current) if current == last => {}
                    Ok(current) => {
                        let deleted = current.is_none();
                        if tx.send(Ok(current.clone())).is_err() || deleted {
                            break;
                        }
                        last = current;
                    }
                    Err(err) => {
                        tracing::warn!(target = "signaling", session_id = %id, error = %err, "record poll failed");
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            }
        });
        Ok(Subscription::with_forwarder(rx, forwarder))
    }

    async fn subscribe_list(
        &self,
        id: &RecordId,
        list: CandidateList,
    ) -> Result<Subscription<IceCandidateBlob>, SignalingError> {
        self.require_record(id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut conn = self.redis.clone();
        let id = id.clone();
        let poll_interval = self.poll_interval;
        let forwarder = tokio::spawn(async move {
            let key = list_key(&id, list);
            let mut cursor: isize = 0;
            loop {
                let fetched: Result<Vec<String>, redis::RedisError> =
                    conn.lrange(&key, cursor, -1).await;
                let items = match fetched {
                    Ok(items) => items,
                    Err(err) => {
                        let _ = tx.send(Err(err.into()));
                        break;
                    }
                };
                for raw in &items {
                    cursor += 1;
                    match serde_json::from_str::<IceCandidateBlob>(raw) {
                        Ok(candidate) => {
                            if tx.send(Ok(candidate)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(target = "signaling", session_id = %id, error = %err, "skipping malformed candidate");
                        }
                    }
                }
                tokio::time::sleep(poll_interval).await;
                if tx.is_closed() {
                    break;
                }
                let alive: Result<bool, redis::RedisError> = conn.exists(record_key(&id)).await;
                if !matches!(alive, Ok(true)) {
                    break;
                }
            }
        });
        Ok(Subscription::with_forwarder(rx, forwarder))
    }

    async fn delete_record(&self, id: &RecordId) -> Result<(), SignalingError> {
        let mut conn = self.redis.clone();
        let key = record_key(id);
        let (existed, _removed): (bool, i64) = redis::pipe()
            .atomic()
            .exists(&key)
            .del(vec![
                key.clone(),
                list_key(id, CandidateList::Initiator),
                list_key(id, CandidateList::Responder),
            ])
            .query_async(&mut conn)
            .await?;
        if !existed {
            return Err(SignalingError::NotFound(id.clone()));
        }
        tracing::debug!(target = "signaling", session_id = %id, "deleted record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn keys_are_namespaced_per_record() {
        let id = RecordId::from("abc");
        assert_eq!(record_key(&id), "chat:abc");
        assert_eq!(
            list_key(&id, CandidateList::Initiator),
            "chat:abc:initiator_candidates"
        );
        assert_eq!(
            list_key(&id, CandidateList::Responder),
            "chat:abc:responder_candidates"
        );
    }

    #[test_timeout::timeout]
    fn guarded_writes_report_missing_record_and_taken_field() {
        let id = RecordId::from("abc");
        assert_eq!(
            script_outcome(-1, &id, Some(RecordField::Answer)),
            Err(SignalingError::NotFound(id.clone()))
        );
        assert_eq!(script_outcome(-1, &id, None), Err(SignalingError::NotFound(id.clone())));
        assert_eq!(
            script_outcome(0, &id, Some(RecordField::Answer)),
            Err(SignalingError::FieldAlreadySet(RecordField::Answer))
        );
        assert_eq!(script_outcome(1, &id, Some(RecordField::Offer)), Ok(()));
        assert_eq!(script_outcome(1, &id, None), Ok(()));
    }

    #[test_timeout::timeout]
    fn parse_record_reads_description_fields() {
        let id = RecordId::from("abc");
        assert_eq!(parse_record(&id, &HashMap::new()).unwrap(), None);

        let mut fields = HashMap::new();
        fields.insert(CREATED_AT_FIELD.to_string(), "1700000000".to_string());
        fields.insert(
            "offer".to_string(),
            r#"{"type":"offer","sdp":"v=0"}"#.to_string(),
        );
        let record = parse_record(&id, &fields).unwrap().unwrap();
        assert_eq!(record.offer, Some(SessionDescription::offer("v=0")));
        assert!(record.answer.is_none());

        fields.insert("answer".to_string(), "not json".to_string());
        assert!(matches!(
            parse_record(&id, &fields),
            Err(SignalingError::Malformed(_))
        ));
    }
}
