//! The capability surface the engine consumes from its host chain.
//!
//! The engine is only ever a client of this trait: it never sees the chain
//! directly, and every method must behave as a pure function for the
//! duration of one API call (`storage_commit` excepted, which the host
//! calls after the engine has handed over the change set).

pub mod in_memory;

use crate::track::StorageChangeSet;
use crate::types::*;

pub use in_memory::InMemoryHost;

/// How the host is asked for a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractIdentifier {
    Name(String),
    Address(ContractAddress),
}

impl fmt::Display for ContractIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ContractIdentifier::Name(name) => write!(f, "{}", name),
            ContractIdentifier::Address(address) => write!(f, "@{}", address),
        }
    }
}

/// Host-declared facts about a deployed contract. The registry refuses to
/// hand out a module whose exported API table disagrees with these.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContractMetadata {
    pub apis: Vec<String>,
    /// Query-only APIs, callable outside consensus.
    pub offline_apis: Vec<String>,
    /// Optional per-API argument type strings, e.g. `"string"`.
    pub arg_types: IndexMap<String, Vec<String>>,
    /// Lifetime state as the chain sees it; `None` means unrestricted.
    pub state: Option<String>,
}

/// A contract as opened through the host: its compiled module plus the
/// metadata the registry validates against. Native modules carry no bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedContract {
    pub address: ContractAddress,
    pub bytecode: Vec<u8>,
    pub metadata: ContractMetadata,
}

pub trait HostInterface {
    fn check_contract_exists(&self, identifier: &ContractIdentifier) -> bool;

    fn open_contract(&self, identifier: &ContractIdentifier) -> Result<OpenedContract, HostError>;

    fn get_contract_address_by_name(&self, name: &str) -> Result<ContractAddress, HostError>;

    fn storage_get(
        &self,
        contract: &ContractAddress,
        slot: &str,
    ) -> Result<Option<Vec<u8>>, HostError>;

    fn storage_commit(&self, changes: &StorageChangeSet) -> Result<(), HostError>;

    fn emit_event(&self, contract: &ContractAddress, name: &str, arg: &str);

    fn transfer(
        &self,
        from: &ContractAddress,
        to: &str,
        asset: &str,
        amount: i64,
    ) -> Result<(), HostError>;

    fn get_balance(&self, contract: &ContractAddress, asset: &str) -> Result<i64, HostError>;

    fn now(&self) -> u64;

    fn current_block_number(&self) -> u64;

    fn tx_id(&self) -> String;

    fn random(&self) -> u64;

    /// The account that signed the transaction being evaluated.
    fn caller_address(&self) -> String;

    fn system_asset_symbol(&self) -> String;

    fn is_valid_address(&self, address: &str) -> bool {
        ContractAddress::new(address).is_ok()
    }
}
