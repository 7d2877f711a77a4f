//! Host-side mirror of the instrument's registers.
//!
//! [`ShadowState`] holds the last committed register words plus a staged raw
//! code per field. A field is dirty exactly when its staged code differs
//! from the committed one; staging the committed value again clears the
//! stage instead of leaving a no-op write behind.
//!
//! Staging validates first and mutates second, so a rejected value never
//! leaves the shadow half-updated. Committed words only change through
//! [`ShadowState::apply`] (a whole acknowledged transaction) or
//! [`ShadowState::sync`] (a register read-back after deploy).

use std::sync::Arc;

use mokulink_transport::{DatalogCommand, RegisterWord};
use tracing::debug;

use crate::commit::{Transaction, TransactionEntry};
use crate::error::{MokuError, Result};
use crate::register::{RegisterMap, REGISTER_COUNT, REG_STATE};

/// A value to stage: physical units, or a raw register code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Physical(f64),
    Raw(u64),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Physical(value)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Raw(u64::from(flag))
    }
}

impl From<u64> for Value {
    fn from(raw: u64) -> Self {
        Value::Raw(raw)
    }
}

/// Register mirror with per-field dirty tracking.
#[derive(Debug, Clone)]
pub struct ShadowState {
    map: Arc<RegisterMap>,
    committed: Vec<u32>,
    staged: Vec<Option<u64>>,
    datalog: DatalogCommand,
    valid: bool,
}

impl ShadowState {
    pub fn new(map: Arc<RegisterMap>) -> Self {
        let fields = map.len();
        Self {
            map,
            committed: vec![0; REGISTER_COUNT],
            staged: vec![None; fields],
            datalog: DatalogCommand::Unchanged,
            valid: true,
        }
    }

    pub fn map(&self) -> &Arc<RegisterMap> {
        &self.map
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(MokuError::NotDeployed)
        }
    }

    /// Stage one field in physical units.
    pub fn stage(&mut self, name: &str, value: f64) -> Result<()> {
        self.stage_group(&[(name, Value::Physical(value))])
    }

    /// Stage one field as a raw code.
    pub fn stage_raw(&mut self, name: &str, raw: u64) -> Result<()> {
        self.stage_group(&[(name, Value::Raw(raw))])
    }

    /// Stage several fields as one unit: either every value validates and
    /// all are staged, or nothing changes.
    pub fn stage_group(&mut self, values: &[(&str, Value)]) -> Result<()> {
        self.ensure_valid()?;
        let mut encoded = Vec::with_capacity(values.len());
        for (name, value) in values {
            let idx = self.map.index_of(name)?;
            let field = &self.map.fields()[idx];
            let raw = match *value {
                Value::Physical(v) => field.encode(v)?,
                Value::Raw(r) => field.check_raw(r)?,
            };
            encoded.push((idx, raw));
        }
        for (idx, raw) in encoded {
            let committed = self.map.fields()[idx].extract(&self.committed);
            self.staged[idx] = (raw != committed).then_some(raw);
        }
        Ok(())
    }

    /// Queue a datalogger command for the next commit. A later call replaces
    /// an earlier one that has not been committed yet.
    pub fn stage_datalog(&mut self, command: DatalogCommand) -> Result<()> {
        self.ensure_valid()?;
        self.datalog = command;
        Ok(())
    }

    pub fn pending_datalog(&self) -> &DatalogCommand {
        &self.datalog
    }

    /// Current view in physical units: the staged value if dirty, otherwise
    /// the committed one.
    pub fn read(&self, name: &str) -> Result<f64> {
        let idx = self.map.index_of(name)?;
        Ok(self.map.fields()[idx].decode(self.raw_at(idx)))
    }

    /// Current view as a raw code.
    pub fn read_raw(&self, name: &str) -> Result<u64> {
        let idx = self.map.index_of(name)?;
        Ok(self.raw_at(idx))
    }

    pub fn read_committed(&self, name: &str) -> Result<f64> {
        let field = self.map.field(name)?;
        Ok(field.decode(field.extract(&self.committed)))
    }

    pub fn read_committed_raw(&self, name: &str) -> Result<u64> {
        Ok(self.map.field(name)?.extract(&self.committed))
    }

    fn raw_at(&self, idx: usize) -> u64 {
        self.staged[idx].unwrap_or_else(|| self.map.fields()[idx].extract(&self.committed))
    }

    pub fn is_dirty(&self, name: &str) -> Result<bool> {
        Ok(self.staged[self.map.index_of(name)?].is_some())
    }

    /// Dirty field names in declaration order.
    pub fn dirty_fields(&self) -> Vec<&'static str> {
        self.map
            .fields()
            .iter()
            .zip(&self.staged)
            .filter(|(_, staged)| staged.is_some())
            .map(|(field, _)| field.name())
            .collect()
    }

    /// True when a commit would change anything besides the state id.
    pub fn has_pending(&self) -> bool {
        self.staged.iter().any(Option::is_some) || self.datalog != DatalogCommand::Unchanged
    }

    /// Last committed register words, indexed by address.
    pub fn committed_words(&self) -> &[u32] {
        &self.committed
    }

    /// Snapshot every dirty field into a transaction tagged with `state_id`.
    ///
    /// Whole register words are composed from the staged codes laid over the
    /// committed words, in the order their fields are declared. The state
    /// word always comes last.
    pub fn transaction(&self, epoch: u64, state_id: u8) -> Result<Transaction> {
        self.ensure_valid()?;
        let mut words = self.committed.clone();
        let mut order: Vec<u8> = Vec::new();
        let mut entries = Vec::new();

        for (field, staged) in self.map.fields().iter().zip(&self.staged) {
            if let Some(raw) = *staged {
                field.insert(&mut words, raw);
                for address in field.addresses() {
                    if address != REG_STATE && !order.contains(&address) {
                        order.push(address);
                    }
                }
                entries.push(TransactionEntry {
                    field: field.name(),
                    raw,
                });
            }
        }

        for name in ["state_id", "state_id_alt"] {
            if let Ok(field) = self.map.field(name) {
                field.insert(&mut words, u64::from(state_id));
            }
        }
        order.push(REG_STATE);

        let writes = order
            .into_iter()
            .map(|address| RegisterWord::new(address, words[usize::from(address)]))
            .collect();

        Ok(Transaction {
            epoch,
            state_id,
            entries,
            writes,
            datalog: self.datalog.clone(),
        })
    }

    /// Adopt an acknowledged transaction as the committed state.
    ///
    /// Fields staged again while the transaction was in flight stay dirty
    /// unless they now match the committed value.
    pub fn apply(&mut self, transaction: &Transaction) {
        for word in &transaction.writes {
            self.committed[usize::from(word.address)] = word.value;
        }
        self.normalize();
        if self.datalog == transaction.datalog {
            self.datalog = DatalogCommand::Unchanged;
        }
        debug!(
            epoch = transaction.epoch,
            words = transaction.writes.len(),
            "shadow committed"
        );
    }

    /// Load committed words read back from the device.
    pub fn sync(&mut self, words: &[RegisterWord]) {
        for word in words {
            if let Some(slot) = self.committed.get_mut(usize::from(word.address)) {
                *slot = word.value;
            }
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        for (field, staged) in self.map.fields().iter().zip(self.staged.iter_mut()) {
            if *staged == Some(field.extract(&self.committed)) {
                *staged = None;
            }
        }
    }

    /// Drop everything staged and refuse further use. Called when the owning
    /// instrument is detached.
    pub fn invalidate(&mut self) {
        self.staged.iter_mut().for_each(|s| *s = None);
        self.datalog = DatalogCommand::Unchanged;
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{common_fields, RegisterField, REG_AINCTL, REG_OUTLEN};

    fn shadow() -> ShadowState {
        let map = RegisterMap::new().with_fields(common_fields()).with_fields([
            RegisterField::new("trigger_level", 68, 0, 32).signed(),
            RegisterField::new("decimation_rate", 70, 0, 32).bounds(1.0, 4_294_967_295.0),
        ]);
        ShadowState::new(Arc::new(map))
    }

    #[test]
    fn read_sees_staged_value_before_commit() {
        let mut s = shadow();
        s.stage("trigger_level", -1200.0).unwrap();
        assert_eq!(s.read("trigger_level").unwrap(), -1200.0);
        assert_eq!(s.read_committed("trigger_level").unwrap(), 0.0);
        assert!(s.is_dirty("trigger_level").unwrap());
    }

    #[test]
    fn staging_committed_value_is_not_dirty() {
        let mut s = shadow();
        s.stage("trigger_level", 5.0).unwrap();
        s.stage("trigger_level", 0.0).unwrap();
        assert!(!s.is_dirty("trigger_level").unwrap());
        assert!(s.dirty_fields().is_empty());
    }

    #[test]
    fn rejected_group_leaves_state_untouched() {
        let mut s = shadow();
        let err = s
            .stage_group(&[
                ("trigger_level", Value::Physical(3.0)),
                ("decimation_rate", Value::Physical(0.0)),
            ])
            .unwrap_err();
        assert!(matches!(err, MokuError::ValueOutOfRange(_)));
        assert!(s.dirty_fields().is_empty());
        assert_eq!(s.read("trigger_level").unwrap(), 0.0);
    }

    #[test]
    fn transaction_orders_by_declaration_and_ends_with_state() {
        let mut s = shadow();
        s.stage("decimation_rate", 4.0).unwrap();
        s.stage_raw("relays_ch2", 0b101).unwrap();
        s.stage_raw("x_mode", 1).unwrap();

        let txn = s.transaction(7, 7).unwrap();
        let fields: Vec<_> = txn.entries.iter().map(|e| e.field).collect();
        assert_eq!(fields, ["x_mode", "relays_ch2", "decimation_rate"]);
        let addresses: Vec<_> = txn.writes.iter().map(|w| w.address).collect();
        assert_eq!(addresses, [REG_OUTLEN, REG_AINCTL, 70, REG_STATE]);
        assert_eq!(txn.writes[0].value, 1 << 29);
        assert_eq!(txn.writes[3].value, 7 | (7 << 16));
    }

    #[test]
    fn apply_commits_and_keeps_later_stages() {
        let mut s = shadow();
        s.stage_raw("relays_ch1", 0b111).unwrap();
        let txn = s.transaction(1, 1).unwrap();

        s.stage_raw("relays_ch2", 0b010).unwrap();
        s.apply(&txn);

        assert_eq!(s.read_committed("relays_ch1").unwrap(), 7.0);
        assert_eq!(s.dirty_fields(), ["relays_ch2"]);
        assert_eq!(s.read_committed("state_id").unwrap(), 1.0);
    }

    #[test]
    fn shared_word_keeps_committed_neighbours() {
        let mut s = shadow();
        s.sync(&[RegisterWord::new(REG_AINCTL, 0b110_000)]);
        s.stage_raw("relays_ch1", 0b001).unwrap();
        let txn = s.transaction(2, 2).unwrap();
        assert_eq!(txn.writes[0], RegisterWord::new(REG_AINCTL, 0b110_001));
    }

    #[test]
    fn sync_clears_stages_that_now_match() {
        let mut s = shadow();
        s.stage_raw("relays_ch1", 3).unwrap();
        s.sync(&[RegisterWord::new(REG_AINCTL, 3)]);
        assert!(!s.is_dirty("relays_ch1").unwrap());
    }

    #[test]
    fn invalidated_shadow_refuses_stage() {
        let mut s = shadow();
        s.stage_raw("relays_ch1", 3).unwrap();
        s.invalidate();
        assert!(s.dirty_fields().is_empty());
        assert!(matches!(
            s.stage_raw("relays_ch1", 1),
            Err(MokuError::NotDeployed)
        ));
    }
}
