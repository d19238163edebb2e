use std::collections::HashMap;

use crate::datapoint::DataPoint;
use crate::device::{Device, DeviceError};

/// Accumulates data-point writes and flushes them as a single request.
///
/// Staging is keyed by data-point id, so setting the same id twice keeps
/// only the last value. Committing an empty transaction is a no-op.
#[derive(Debug, Default)]
pub struct Transaction {
    staged: HashMap<u8, DataPoint>,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Stage a write. Replaces any previously staged value for the same id.
    pub fn set(&mut self, datapoint: DataPoint) {
        self.staged.insert(datapoint.id, datapoint);
    }

    /// A staged value, if this transaction holds one for `id`. Unstaged ids
    /// are answered by [`Device::get_datapoint`].
    pub fn get(&self, id: u8) -> Option<&DataPoint> {
        self.staged.get(&id)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// The staged writes, ordered by id.
    pub fn datapoints(&self) -> Vec<DataPoint> {
        let mut datapoints: Vec<DataPoint> = self.staged.values().cloned().collect();
        datapoints.sort_by_key(|dp| dp.id);
        datapoints
    }

    /// Flush every staged write to the device in one request.
    pub async fn commit(self, device: &Device) -> Result<(), DeviceError> {
        device.set_datapoints(&self.datapoints()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::DpValue;

    #[test]
    fn last_write_per_id_wins() {
        let mut txn = Transaction::new();
        txn.set(DataPoint::new(5, DpValue::Value(20)).unwrap());
        txn.set(DataPoint::new(1, DpValue::Bool(true)).unwrap());
        txn.set(DataPoint::new(5, DpValue::Value(80)).unwrap());

        assert_eq!(txn.len(), 2);
        assert_eq!(txn.get(5).unwrap().value, DpValue::Value(80));
    }

    #[test]
    fn datapoints_are_ordered_by_id() {
        let mut txn = Transaction::new();
        txn.set(DataPoint::new(8, DpValue::Value(100)).unwrap());
        txn.set(DataPoint::new(2, DpValue::Enum(1)).unwrap());
        txn.set(DataPoint::new(5, DpValue::Bool(false)).unwrap());

        let ids: Vec<u8> = txn.datapoints().iter().map(|dp| dp.id).collect();
        assert_eq!(ids, vec![2, 5, 8]);
    }

    #[test]
    fn unstaged_id_is_absent() {
        let mut txn = Transaction::new();
        assert!(txn.is_empty());
        txn.set(DataPoint::new(1, DpValue::Bool(true)).unwrap());
        assert_eq!(txn.get(2), None);
    }
}
