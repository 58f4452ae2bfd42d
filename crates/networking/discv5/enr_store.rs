//! The node record store: the only state shared between services, keyed by
//! node id and accessed through awaitable methods. Writes are serialized by
//! the backing server and atomic per node id.

use crate::{
    scheme::IdentitySchemeRegistry,
    types::{Enr, EnrError},
};
use ethereum_types::H256;
use rustc_hash::FxHashMap;
use spawned_concurrency::{
    error::GenServerError,
    tasks::{CallResponse, CastResponse, GenServer, GenServerHandle, InitResult},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EnrStoreError {
    #[error("a record for node {0:#x} already exists")]
    AlreadyExists(H256),
    #[error("no record for node {0:#x}")]
    NotFound(H256),
    #[error(transparent)]
    Enr(#[from] EnrError),
    #[error("internal error: {0}")]
    Internal(#[from] GenServerError),
}

/// Handle to the record store.
#[derive(Debug, Clone)]
pub struct EnrStore {
    handle: GenServerHandle<EnrStoreServer>,
}

impl EnrStore {
    pub fn spawn(registry: IdentitySchemeRegistry) -> EnrStore {
        EnrStore {
            handle: EnrStoreServer::new(registry).start(),
        }
    }

    /// Inserts a new record; fails if one exists for the node.
    pub async fn insert(&mut self, record: Enr) -> Result<(), EnrStoreError> {
        match self.handle.call(CallMessage::Insert(Box::new(record))).await? {
            OutMessage::Done => Ok(()),
            OutMessage::AlreadyExists(node_id) => Err(EnrStoreError::AlreadyExists(node_id)),
            OutMessage::InvalidRecord(err) => Err(EnrStoreError::Enr(err)),
            _ => unreachable!(),
        }
    }

    /// Replaces the stored record if the new one has a strictly higher
    /// sequence number; otherwise leaves the store untouched. Fails if no
    /// record exists for the node.
    pub async fn update(&mut self, record: Enr) -> Result<(), EnrStoreError> {
        match self.handle.call(CallMessage::Update(Box::new(record))).await? {
            OutMessage::Done => Ok(()),
            OutMessage::NotFound(node_id) => Err(EnrStoreError::NotFound(node_id)),
            OutMessage::InvalidRecord(err) => Err(EnrStoreError::Enr(err)),
            _ => unreachable!(),
        }
    }

    /// Inserts or seq-gated-updates, whichever applies.
    pub async fn insert_or_update(&mut self, record: Enr) -> Result<(), EnrStoreError> {
        match self
            .handle
            .call(CallMessage::InsertOrUpdate(Box::new(record)))
            .await?
        {
            OutMessage::Done => Ok(()),
            OutMessage::InvalidRecord(err) => Err(EnrStoreError::Enr(err)),
            _ => unreachable!(),
        }
    }

    pub async fn get(&mut self, node_id: H256) -> Result<Option<Enr>, EnrStoreError> {
        match self.handle.call(CallMessage::Get(node_id)).await? {
            OutMessage::Record(record) => Ok(Some(*record)),
            OutMessage::NotFound(_) => Ok(None),
            _ => unreachable!(),
        }
    }

    pub async fn contains(&mut self, node_id: H256) -> Result<bool, EnrStoreError> {
        match self.handle.call(CallMessage::Contains(node_id)).await? {
            OutMessage::Contains(present) => Ok(present),
            _ => unreachable!(),
        }
    }

    /// Removes the record for a node; removing an absent node is a no-op.
    pub async fn remove(&mut self, node_id: H256) -> Result<(), EnrStoreError> {
        self.handle.cast(CastMessage::Remove(node_id)).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EnrStoreError> {
        self.handle.cast(CastMessage::Shutdown).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct EnrStoreServer {
    records: FxHashMap<H256, Enr>,
    registry: IdentitySchemeRegistry,
}

impl EnrStoreServer {
    fn new(registry: IdentitySchemeRegistry) -> Self {
        Self {
            records: Default::default(),
            registry,
        }
    }

    /// Checks that we know the record's identity scheme and returns its
    /// node id. Performed on every write so later reads cannot encounter a
    /// record we are unable to interpret.
    fn validate(&self, record: &Enr) -> Result<H256, EnrError> {
        record.node_id(&self.registry)
    }

    fn insert(&mut self, record: Enr) -> OutMessage {
        let node_id = match self.validate(&record) {
            Ok(node_id) => node_id,
            Err(err) => return OutMessage::InvalidRecord(err),
        };
        if self.records.contains_key(&node_id) {
            return OutMessage::AlreadyExists(node_id);
        }
        debug!(node_id = %node_id, seq = record.seq(), "Inserting new record");
        self.records.insert(node_id, record);
        OutMessage::Done
    }

    fn update(&mut self, record: Enr) -> OutMessage {
        let node_id = match self.validate(&record) {
            Ok(node_id) => node_id,
            Err(err) => return OutMessage::InvalidRecord(err),
        };
        let Some(existing) = self.records.get(&node_id) else {
            return OutMessage::NotFound(node_id);
        };
        if existing.seq() < record.seq() {
            debug!(
                node_id = %node_id,
                from = existing.seq(),
                to = record.seq(),
                "Updating record"
            );
            self.records.insert(node_id, record);
        } else {
            debug!(
                node_id = %node_id,
                seq = record.seq(),
                current = existing.seq(),
                "Not updating record, sequence number is not higher"
            );
        }
        OutMessage::Done
    }

    fn insert_or_update(&mut self, record: Enr) -> OutMessage {
        match self.update(record.clone()) {
            OutMessage::NotFound(_) => self.insert(record),
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
enum CallMessage {
    Insert(Box<Enr>),
    Update(Box<Enr>),
    InsertOrUpdate(Box<Enr>),
    Get(H256),
    Contains(H256),
}

#[derive(Debug, Clone)]
enum CastMessage {
    Remove(H256),
    Shutdown,
}

#[derive(Debug)]
enum OutMessage {
    Done,
    AlreadyExists(H256),
    NotFound(H256),
    Record(Box<Enr>),
    Contains(bool),
    InvalidRecord(EnrError),
}

impl GenServer for EnrStoreServer {
    type CallMsg = CallMessage;
    type CastMsg = CastMessage;
    type OutMsg = OutMessage;
    type Error = EnrStoreError;

    async fn init(self, _handle: &GenServerHandle<Self>) -> Result<InitResult<Self>, Self::Error> {
        Ok(InitResult::Success(self))
    }

    async fn handle_call(
        &mut self,
        message: Self::CallMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CallResponse<Self> {
        match message {
            CallMessage::Insert(record) => CallResponse::Reply(self.insert(*record)),
            CallMessage::Update(record) => CallResponse::Reply(self.update(*record)),
            CallMessage::InsertOrUpdate(record) => {
                CallResponse::Reply(self.insert_or_update(*record))
            }
            CallMessage::Get(node_id) => CallResponse::Reply(
                self.records
                    .get(&node_id)
                    .cloned()
                    .map(Box::new)
                    .map_or(OutMessage::NotFound(node_id), OutMessage::Record),
            ),
            CallMessage::Contains(node_id) => {
                CallResponse::Reply(OutMessage::Contains(self.records.contains_key(&node_id)))
            }
        }
    }

    async fn handle_cast(
        &mut self,
        message: Self::CastMsg,
        _handle: &GenServerHandle<Self>,
    ) -> CastResponse {
        match message {
            CastMessage::Remove(node_id) => {
                if self.records.remove(&node_id).is_some() {
                    debug!(node_id = %node_id, "Removing record");
                }
            }
            CastMessage::Shutdown => return CastResponse::Stop,
        }
        CastResponse::NoReply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnrBuilder, ID_ENR_KEY};
    use secp256k1::{SECP256K1, SecretKey};

    fn registry() -> IdentitySchemeRegistry {
        IdentitySchemeRegistry::with_default_schemes()
    }

    fn record_with_seq(seed: u8, seq: u64) -> Enr {
        let signer = SecretKey::from_slice(&[seed; 32]).unwrap();
        EnrBuilder::new(seq)
            .add(ID_ENR_KEY, "v4")
            .add(
                b"secp256k1",
                signer.public_key(SECP256K1).serialize().as_slice(),
            )
            .sign(&signer.secret_bytes(), &registry())
            .unwrap()
    }

    #[tokio::test]
    async fn insert_then_get() {
        let mut store = EnrStore::spawn(registry());
        let record = record_with_seq(0x01, 1);
        let node_id = record.node_id(&registry()).unwrap();

        store.insert(record.clone()).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(record.clone()));
        assert!(store.contains(node_id).await.unwrap());

        assert!(matches!(
            store.insert(record).await,
            Err(EnrStoreError::AlreadyExists(id)) if id == node_id
        ));
    }

    #[tokio::test]
    async fn update_is_gated_on_sequence_number() {
        let mut store = EnrStore::spawn(registry());
        let old = record_with_seq(0x02, 2);
        let node_id = old.node_id(&registry()).unwrap();
        store.insert(old.clone()).await.unwrap();

        // same seq: a no-op
        store.update(record_with_seq(0x02, 2)).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(old.clone()));

        // lower seq: also a no-op
        store.update(record_with_seq(0x02, 1)).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(old));

        // higher seq: replaced
        let newer = record_with_seq(0x02, 3);
        store.update(newer.clone()).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn update_unknown_node_fails() {
        let mut store = EnrStore::spawn(registry());
        assert!(matches!(
            store.update(record_with_seq(0x03, 1)).await,
            Err(EnrStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn insert_or_update_composes() {
        let mut store = EnrStore::spawn(registry());
        let record = record_with_seq(0x04, 1);
        let node_id = record.node_id(&registry()).unwrap();

        store.insert_or_update(record.clone()).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(record.clone()));

        // inserting the same seq twice is a no-op
        store.insert_or_update(record.clone()).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(record));

        let newer = record_with_seq(0x04, 5);
        store.insert_or_update(newer.clone()).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let mut store = EnrStore::spawn(registry());
        let record = record_with_seq(0x05, 1);
        let node_id = record.node_id(&registry()).unwrap();
        store.insert(record).await.unwrap();

        store.remove(node_id).await.unwrap();
        store.remove(node_id).await.unwrap();
        assert_eq!(store.get(node_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_scheme_rejected() {
        let mut store = EnrStore::spawn(IdentitySchemeRegistry::new());
        assert!(matches!(
            store.insert(record_with_seq(0x06, 1)).await,
            Err(EnrStoreError::Enr(EnrError::UnknownScheme(_)))
        ));
    }
}
