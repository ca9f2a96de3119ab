//! A self-contained host for tests and embedders: contracts, storage,
//! balances and the event sink all live in one `RefCell`'d state.

use crate::host::{ContractIdentifier, ContractMetadata, HostInterface, OpenedContract};
use crate::track::StorageChangeSet;
use crate::types::*;
use lbor::{lbor_decode, lbor_encode, ValueDiff};
use std::cell::RefCell;

#[derive(Debug, Clone)]
struct ContractRecord {
    address: ContractAddress,
    bytecode: Vec<u8>,
    metadata: ContractMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEvent {
    pub contract: ContractAddress,
    pub name: String,
    pub arg: String,
}

#[derive(Debug, Default)]
struct ChainState {
    names: IndexMap<String, ContractAddress>,
    contracts: IndexMap<ContractAddress, ContractRecord>,
    storage: IndexMap<(ContractAddress, String), Vec<u8>>,
    balances: IndexMap<(String, String), i64>,
    events: Vec<EmittedEvent>,
    caller: String,
    now: u64,
    block_number: u64,
    tx_counter: u64,
    random_state: u64,
}

#[derive(Debug)]
pub struct InMemoryHost {
    state: RefCell<ChainState>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(ChainState {
                caller: "LUNAcaller0".to_owned(),
                now: 1_700_000_000,
                block_number: 1,
                random_state: 0x9E37_79B9,
                ..ChainState::default()
            }),
        }
    }

    pub fn deploy_contract(
        &self,
        name: Option<&str>,
        address: ContractAddress,
        bytecode: Vec<u8>,
        metadata: ContractMetadata,
    ) {
        let mut state = self.state.borrow_mut();
        if let Some(name) = name {
            state.names.insert(name.to_owned(), address.clone());
        }
        state.contracts.insert(
            address.clone(),
            ContractRecord {
                address,
                bytecode,
                metadata,
            },
        );
    }

    pub fn seed_storage(&self, contract: &ContractAddress, slot: &str, value: &lbor::Value) {
        let bytes = lbor_encode(value).expect("seed value must encode");
        self.state
            .borrow_mut()
            .storage
            .insert((contract.clone(), slot.to_owned()), bytes);
    }

    pub fn set_caller(&self, caller: &str) {
        self.state.borrow_mut().caller = caller.to_owned();
    }

    pub fn set_balance(&self, account: &str, asset: &str, amount: i64) {
        self.state
            .borrow_mut()
            .balances
            .insert((account.to_owned(), asset.to_owned()), amount);
    }

    pub fn balance_of(&self, account: &str, asset: &str) -> i64 {
        self.state
            .borrow()
            .balances
            .get(&(account.to_owned(), asset.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    pub fn emitted_events(&self) -> Vec<EmittedEvent> {
        self.state.borrow().events.clone()
    }

    pub fn advance_block(&self) {
        let mut state = self.state.borrow_mut();
        state.block_number += 1;
        state.now += 10;
    }

    fn resolve(&self, identifier: &ContractIdentifier) -> Option<ContractAddress> {
        let state = self.state.borrow();
        match identifier {
            ContractIdentifier::Name(name) => state.names.get(name).cloned(),
            ContractIdentifier::Address(address) => state
                .contracts
                .contains_key(address)
                .then(|| address.clone()),
        }
    }
}

impl HostInterface for InMemoryHost {
    fn check_contract_exists(&self, identifier: &ContractIdentifier) -> bool {
        self.resolve(identifier).is_some()
    }

    fn open_contract(&self, identifier: &ContractIdentifier) -> Result<OpenedContract, HostError> {
        let address = self
            .resolve(identifier)
            .ok_or_else(|| HostError::contract_not_found(&identifier.to_string()))?;
        let state = self.state.borrow();
        let record = &state.contracts[&address];
        Ok(OpenedContract {
            address: record.address.clone(),
            bytecode: record.bytecode.clone(),
            metadata: record.metadata.clone(),
        })
    }

    fn get_contract_address_by_name(&self, name: &str) -> Result<ContractAddress, HostError> {
        self.state
            .borrow()
            .names
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::contract_not_found(name))
    }

    fn storage_get(
        &self,
        contract: &ContractAddress,
        slot: &str,
    ) -> Result<Option<Vec<u8>>, HostError> {
        Ok(self
            .state
            .borrow()
            .storage
            .get(&(contract.clone(), slot.to_owned()))
            .cloned())
    }

    /// Applies each diff to the stored pre-image and checks the result
    /// against the declared post-image before persisting it, then drops
    /// `Null` post-images.
    fn storage_commit(&self, changes: &StorageChangeSet) -> Result<(), HostError> {
        let mut state = self.state.borrow_mut();
        for entry in changes {
            let key = (entry.contract.clone(), entry.slot.clone());
            let stored_before = match state.storage.get(&key) {
                Some(bytes) => lbor_decode(bytes)
                    .map_err(|e| HostError::new(500, format!("stored value corrupt: {:?}", e)))?,
                None => lbor::Value::Null,
            };
            let diff = ValueDiff::from_bytes(&entry.diff_bytes)
                .map_err(|e| HostError::new(400, format!("malformed diff: {:?}", e)))?;
            let applied = lbor::diff::apply(&stored_before, &diff)
                .map_err(|e| HostError::new(409, format!("diff does not apply: {:?}", e)))?;
            if applied != entry.after {
                return Err(HostError::new(409, "diff and post-image disagree"));
            }
            if entry.after.is_null() {
                state.storage.shift_remove(&key);
            } else {
                let bytes = lbor_encode(&entry.after)
                    .map_err(|e| HostError::new(500, format!("encode failed: {:?}", e)))?;
                state.storage.insert(key, bytes);
            }
        }
        Ok(())
    }

    fn emit_event(&self, contract: &ContractAddress, name: &str, arg: &str) {
        self.state.borrow_mut().events.push(EmittedEvent {
            contract: contract.clone(),
            name: name.to_owned(),
            arg: arg.to_owned(),
        });
    }

    fn transfer(
        &self,
        from: &ContractAddress,
        to: &str,
        asset: &str,
        amount: i64,
    ) -> Result<(), HostError> {
        if amount <= 0 {
            return Err(HostError::new(400, "transfer amount must be positive"));
        }
        let mut state = self.state.borrow_mut();
        let from_key = (from.as_str().to_owned(), asset.to_owned());
        let from_balance = state.balances.get(&from_key).copied().unwrap_or(0);
        if from_balance < amount {
            return Err(HostError::new(402, "insufficient balance"));
        }
        let to_key = (to.to_owned(), asset.to_owned());
        let to_balance = state.balances.get(&to_key).copied().unwrap_or(0);
        state.balances.insert(from_key, from_balance - amount);
        state.balances.insert(to_key, to_balance + amount);
        Ok(())
    }

    fn get_balance(&self, contract: &ContractAddress, asset: &str) -> Result<i64, HostError> {
        Ok(self.balance_of(contract.as_str(), asset))
    }

    fn now(&self) -> u64 {
        self.state.borrow().now
    }

    fn current_block_number(&self) -> u64 {
        self.state.borrow().block_number
    }

    fn tx_id(&self) -> String {
        let mut state = self.state.borrow_mut();
        state.tx_counter += 1;
        format!("tx-{:016x}", state.tx_counter)
    }

    fn random(&self) -> u64 {
        // xorshift; seeded, so replays agree
        let mut state = self.state.borrow_mut();
        let mut x = state.random_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        state.random_state = x;
        x
    }

    fn caller_address(&self) -> String {
        self.state.borrow().caller.clone()
    }

    fn system_asset_symbol(&self) -> String {
        "LUNA".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::StorageTrack;

    fn addr(s: &str) -> ContractAddress {
        ContractAddress::new(s).unwrap()
    }

    #[test]
    fn test_commit_round_trips_through_diffs() {
        let host = InMemoryHost::new();
        let contract = addr("CONx");
        host.seed_storage(&contract, "v", &lbor::Value::Integer(1));

        let mut track = StorageTrack::new();
        track
            .write(&host, &contract, "v", lbor::Value::Integer(2))
            .unwrap();
        track
            .write(&host, &contract, "fresh", lbor::Value::Bool(true))
            .unwrap();
        let set = track.finalize().unwrap();
        host.storage_commit(&set).unwrap();

        assert_eq!(
            host.storage_get(&contract, "v").unwrap(),
            Some(lbor_encode(&lbor::Value::Integer(2)).unwrap())
        );
        assert_eq!(
            host.storage_get(&contract, "fresh").unwrap(),
            Some(lbor_encode(&lbor::Value::Bool(true)).unwrap())
        );
    }

    #[test]
    fn test_commit_null_deletes() {
        let host = InMemoryHost::new();
        let contract = addr("CONx");
        host.seed_storage(&contract, "v", &lbor::Value::Integer(1));

        let mut track = StorageTrack::new();
        track
            .write(&host, &contract, "v", lbor::Value::Null)
            .unwrap();
        host.storage_commit(&track.finalize().unwrap()).unwrap();
        assert_eq!(host.storage_get(&contract, "v").unwrap(), None);
    }

    #[test]
    fn test_transfer_and_balances() {
        let host = InMemoryHost::new();
        let from = addr("CONfrom");
        host.set_balance("CONfrom", "LUNA", 100);
        host.transfer(&from, "LUNAbob", "LUNA", 40).unwrap();
        assert_eq!(host.balance_of("CONfrom", "LUNA"), 60);
        assert_eq!(host.balance_of("LUNAbob", "LUNA"), 40);
        let err = host.transfer(&from, "LUNAbob", "LUNA", 1000).unwrap_err();
        assert_eq!(err.code, 402);
    }
}
