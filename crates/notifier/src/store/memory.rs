use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;

use mds_core::{
    ActiveIntelDelivery, ActiveIntelDeliveryAttempt, AddressBookEntryId, Error, Intel, IntelDeliveryAttemptId,
    IntelDeliveryId, IntelId, OpenIntelDeliverySummary, Operation, OperationId, Result, User, UserId,
};
use mds_infra::{MemDatabase, MemTx};

use super::{sort_open_deliveries, NotifierStore};

/// Whole read model held in memory.
#[derive(Debug, Clone, Default)]
pub struct NotifierState {
    pub operations: HashMap<OperationId, Operation>,
    pub users: HashMap<UserId, User>,
    pub operation_members: HashMap<OperationId, BTreeSet<UserId>>,
    pub intel: HashMap<IntelId, Intel>,
    pub deliveries: HashMap<IntelDeliveryId, ActiveIntelDelivery>,
    pub attempts: HashMap<IntelDeliveryAttemptId, ActiveIntelDeliveryAttempt>,
    pub auto_delivery: HashSet<AddressBookEntryId>,
}

impl NotifierState {
    fn intel_operation(&self, intel: IntelId) -> Result<OperationId> {
        self.intel
            .get(&intel)
            .map(|i| i.operation)
            .ok_or_else(|| Error::not_found(format!("intel {intel}")))
    }

    fn delivery_operation(&self, delivery: IntelDeliveryId) -> Result<OperationId> {
        let delivery = self
            .deliveries
            .get(&delivery)
            .ok_or_else(|| Error::not_found(format!("active intel delivery {delivery}")))?;
        self.intel_operation(delivery.intel)
    }
}

type Tx = MemTx<NotifierState>;

#[async_trait]
impl NotifierStore for MemDatabase<NotifierState> {
    async fn create_user(&self, tx: &mut Tx, user: &User) -> Result<()> {
        tx.users.entry(user.id).or_insert_with(|| user.clone());
        Ok(())
    }

    async fn update_user(&self, tx: &mut Tx, user: &User) -> Result<()> {
        tx.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete_user(&self, tx: &mut Tx, id: UserId) -> Result<()> {
        tx.users.remove(&id);
        for members in tx.operation_members.values_mut() {
            members.remove(&id);
        }
        Ok(())
    }

    async fn create_operation(&self, tx: &mut Tx, operation: &Operation) -> Result<()> {
        tx.operations
            .entry(operation.id)
            .or_insert_with(|| operation.clone());
        Ok(())
    }

    async fn update_operation(&self, tx: &mut Tx, operation: &Operation) -> Result<()> {
        match tx.operations.get_mut(&operation.id) {
            Some(current) => {
                *current = operation.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("operation {}", operation.id))),
        }
    }

    async fn update_operation_members(&self, tx: &mut Tx, operation: OperationId, members: &[UserId]) -> Result<()> {
        tx.operation_members
            .insert(operation, members.iter().copied().collect());
        Ok(())
    }

    async fn create_intel(&self, tx: &mut Tx, intel: &Intel) -> Result<()> {
        tx.intel.entry(intel.id).or_insert_with(|| intel.clone());
        Ok(())
    }

    async fn invalidate_intel(&self, tx: &mut Tx, id: IntelId) -> Result<()> {
        let intel = tx
            .intel
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("intel {id}")))?;
        intel.is_valid = false;
        Ok(())
    }

    async fn create_active_delivery(&self, tx: &mut Tx, delivery: &ActiveIntelDelivery) -> Result<()> {
        tx.deliveries
            .entry(delivery.id)
            .or_insert_with(|| delivery.clone());
        Ok(())
    }

    async fn delete_active_delivery(&self, tx: &mut Tx, id: IntelDeliveryId) -> Result<()> {
        tx.deliveries
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("active intel delivery {id}")))?;
        tx.attempts.retain(|_, a| a.delivery != id);
        Ok(())
    }

    async fn create_active_attempt(&self, tx: &mut Tx, attempt: &ActiveIntelDeliveryAttempt) -> Result<()> {
        if !tx.deliveries.contains_key(&attempt.delivery) {
            return Err(Error::not_found(format!("active intel delivery {}", attempt.delivery)));
        }
        tx.attempts.entry(attempt.id).or_insert_with(|| attempt.clone());
        Ok(())
    }

    async fn delete_active_attempt(&self, tx: &mut Tx, id: IntelDeliveryAttemptId) -> Result<()> {
        tx.attempts
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("active intel delivery attempt {id}")))
    }

    async fn set_auto_intel_delivery_enabled(&self, tx: &mut Tx, entry: AddressBookEntryId, enabled: bool) -> Result<()> {
        if enabled {
            tx.auto_delivery.insert(entry);
        } else {
            tx.auto_delivery.remove(&entry);
        }
        Ok(())
    }

    async fn open_deliveries_by_operation(&self, tx: &mut Tx, operation: OperationId) -> Result<Vec<OpenIntelDeliverySummary>> {
        let attempted: HashSet<IntelDeliveryId> = tx.attempts.values().map(|a| a.delivery).collect();
        let mut entries: Vec<OpenIntelDeliverySummary> = tx
            .deliveries
            .values()
            .filter(|d| !attempted.contains(&d.id) && !tx.auto_delivery.contains(&d.to))
            .filter_map(|d| {
                let intel = tx.intel.get(&d.intel)?;
                (intel.operation == operation).then(|| OpenIntelDeliverySummary {
                    delivery: d.clone(),
                    intel: intel.clone(),
                })
            })
            .collect();
        sort_open_deliveries(&mut entries);
        Ok(entries)
    }

    async fn intel_operation(&self, tx: &mut Tx, intel: IntelId) -> Result<OperationId> {
        tx.intel_operation(intel)
    }

    async fn intel_operation_by_delivery(&self, tx: &mut Tx, delivery: IntelDeliveryId) -> Result<OperationId> {
        tx.delivery_operation(delivery)
    }

    async fn intel_operation_by_attempt(&self, tx: &mut Tx, attempt: IntelDeliveryAttemptId) -> Result<OperationId> {
        let delivery = tx
            .attempts
            .get(&attempt)
            .map(|a| a.delivery)
            .ok_or_else(|| Error::not_found(format!("active intel delivery attempt {attempt}")))?;
        tx.delivery_operation(delivery)
    }

    async fn operations_with_deliveries_to(&self, tx: &mut Tx, entry: AddressBookEntryId) -> Result<Vec<OperationId>> {
        let ops: BTreeSet<OperationId> = tx
            .deliveries
            .values()
            .filter(|d| d.to == entry)
            .filter_map(|d| tx.intel.get(&d.intel).map(|i| i.operation))
            .collect();
        Ok(ops.into_iter().collect())
    }
}
