use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::transaction::Transaction;

/// Amount of currency in indivisible base units
pub type Amount = u64;

/// Errors that can occur while applying a state transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Insufficient balance for {address}: required {required}, available {available}")]
    InsufficientBalance {
        address: Address,
        required: Amount,
        available: Amount,
    },

    #[error("Balance overflow crediting {0}")]
    BalanceOverflow(Address),
}

/// Opaque participant identity, supplied by whoever runs the node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct Address(pub String);

/// Reserved origin of reward transactions
const REWARD_ORIGIN: &str = "0";

impl Address {
    /// Creates an address from any string-like value
    pub fn new(address: impl Into<String>) -> Self {
        Address(address.into())
    }

    /// The reserved origin used by reward transactions
    pub fn reward_origin() -> Self {
        Address(REWARD_ORIGIN.to_string())
    }

    /// Checks whether this is the reserved reward origin
    pub fn is_reward_origin(&self) -> bool {
        self.0 == REWARD_ORIGIN
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Address::new(address)
    }
}

/// Represents an account in the ledger state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The account's address
    pub address: Address,

    /// The account's balance
    pub balance: Amount,

    /// Replay-protection counter, carried through transitions untouched
    pub nonce: u64,
}

impl Account {
    /// Creates an empty account
    pub fn new(address: Address) -> Self {
        Account {
            address,
            balance: 0,
            nonce: 0,
        }
    }

    /// Creates an account holding `balance`
    pub fn with_balance(address: Address, balance: Amount) -> Self {
        Account {
            balance,
            ..Account::new(address)
        }
    }

    /// Increases the account's balance
    pub fn deposit(&mut self, amount: Amount) -> Result<(), StateError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| StateError::BalanceOverflow(self.address.clone()))?;
        Ok(())
    }

    /// Decreases the account's balance
    pub fn withdraw(&mut self, amount: Amount) -> Result<(), StateError> {
        if !self.has_sufficient_funds(amount) {
            return Err(StateError::InsufficientBalance {
                address: self.address.clone(),
                required: amount,
                available: self.balance,
            });
        }

        self.balance -= amount;
        Ok(())
    }

    /// Checks if the account can cover `amount`
    pub fn has_sufficient_funds(&self, amount: Amount) -> bool {
        self.balance >= amount
    }
}

/// Snapshot of every account, keyed by address
///
/// Transitions are copy-on-write: the account map sits behind an `Arc` and is
/// only cloned when a transition actually writes to it, so many candidate
/// chains can branch off the same parent state cheaply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<Address, Account>", into = "BTreeMap<Address, Account>")]
pub struct StateStore {
    accounts: Arc<BTreeMap<Address, Account>>,
}

impl From<BTreeMap<Address, Account>> for StateStore {
    fn from(accounts: BTreeMap<Address, Account>) -> Self {
        StateStore {
            accounts: Arc::new(accounts),
        }
    }
}

impl From<StateStore> for BTreeMap<Address, Account> {
    fn from(state: StateStore) -> Self {
        Arc::try_unwrap(state.accounts).unwrap_or_else(|shared| (*shared).clone())
    }
}

impl StateStore {
    /// Creates an empty state
    pub fn new() -> Self {
        StateStore::default()
    }

    /// Creates a state with the given initial balances
    pub fn with_allocations<I>(allocations: I) -> Self
    where
        I: IntoIterator<Item = (Address, Amount)>,
    {
        let accounts = allocations
            .into_iter()
            .map(|(address, balance)| (address.clone(), Account::with_balance(address, balance)))
            .collect::<BTreeMap<_, _>>();
        StateStore::from(accounts)
    }

    /// Looks up an account without creating it
    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    /// Gets an account, or an empty one if the address was never credited
    pub fn account(&self, address: &Address) -> Account {
        self.get(address)
            .cloned()
            .unwrap_or_else(|| Account::new(address.clone()))
    }

    /// Gets the balance of an address (zero if unknown)
    pub fn balance(&self, address: &Address) -> Amount {
        self.get(address).map(|account| account.balance).unwrap_or(0)
    }

    /// Number of accounts in the state
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Iterates over accounts in address order
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Sum of all balances, saturating
    pub fn total_supply(&self) -> Amount {
        self.iter()
            .fold(0, |total: Amount, account| total.saturating_add(account.balance))
    }

    /// Applies one transaction, returning the resulting state
    ///
    /// `self` is left untouched whether or not the transaction applies.
    pub fn apply(&self, transaction: &Transaction) -> Result<StateStore, StateError> {
        let mut next = self.clone();
        next.apply_in_place(transaction)?;
        Ok(next)
    }

    /// Applies a batch of transactions atomically
    ///
    /// Either every transaction applies and the final state is returned, or
    /// the first failure is returned and no partial effect survives.
    pub fn apply_all<'a, I>(&self, transactions: I) -> Result<StateStore, StateError>
    where
        I: IntoIterator<Item = &'a Transaction>,
    {
        let mut next = self.clone();
        for transaction in transactions {
            next.apply_in_place(transaction)?;
        }
        Ok(next)
    }

    fn apply_in_place(&mut self, transaction: &Transaction) -> Result<(), StateError> {
        if transaction.is_reward() {
            return self.credit(&transaction.destination, transaction.value);
        }

        let available = self.balance(&transaction.origin);
        if available < transaction.value {
            return Err(StateError::InsufficientBalance {
                address: transaction.origin.clone(),
                required: transaction.value,
                available,
            });
        }

        if transaction.origin == transaction.destination {
            return Ok(());
        }

        // Overflow must be detected before the debit lands
        let credited = self.balance(&transaction.destination);
        if credited.checked_add(transaction.value).is_none() {
            return Err(StateError::BalanceOverflow(transaction.destination.clone()));
        }

        if let Some(origin) = Arc::make_mut(&mut self.accounts).get_mut(&transaction.origin) {
            origin.withdraw(transaction.value)?;
        }
        self.credit(&transaction.destination, transaction.value)
    }

    fn credit(&mut self, address: &Address, value: Amount) -> Result<(), StateError> {
        let accounts = Arc::make_mut(&mut self.accounts);
        match accounts.get_mut(address) {
            Some(account) => account.deposit(value),
            None => {
                accounts.insert(address.clone(), Account::with_balance(address.clone(), value));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(address: &str, balance: Amount) -> StateStore {
        StateStore::with_allocations([(Address::from(address), balance)])
    }

    #[test]
    fn test_account_creation() {
        let address = Address::from("test_address");
        let account = Account::new(address.clone());

        assert_eq!(account.address, address);
        assert_eq!(account.balance, 0);
        assert_eq!(account.nonce, 0);
    }

    #[test]
    fn test_deposit_and_withdraw() {
        let mut account = Account::new(Address::from("test_address"));

        account.deposit(100).unwrap();
        assert_eq!(account.balance, 100);

        account.withdraw(50).unwrap();
        assert_eq!(account.balance, 50);

        let result = account.withdraw(100);
        assert!(matches!(result, Err(StateError::InsufficientBalance { required: 100, available: 50, .. })));
        assert_eq!(account.balance, 50);

        account.balance = Amount::MAX;
        assert!(matches!(account.deposit(1), Err(StateError::BalanceOverflow(_))));
    }

    #[test]
    fn test_apply_transfers_and_creates_destination() {
        let state = funded("alice", 100);
        let tx = Transaction::new("alice".into(), "bob".into(), 30, "sig");

        let next = state.apply(&tx).unwrap();

        assert_eq!(next.balance(&"alice".into()), 70);
        assert_eq!(next.balance(&"bob".into()), 30);
        assert_eq!(next.account(&"bob".into()).nonce, 0);
        // The input state is untouched
        assert_eq!(state.balance(&"alice".into()), 100);
        assert!(state.get(&"bob".into()).is_none());
    }

    #[test]
    fn test_apply_rejects_insufficient_balance() {
        let state = funded("alice", 10);
        let tx = Transaction::new("alice".into(), "bob".into(), 11, "sig");

        let err = state.apply(&tx).unwrap_err();
        assert_eq!(
            err,
            StateError::InsufficientBalance {
                address: "alice".into(),
                required: 11,
                available: 10,
            }
        );

        // Unknown origins hold nothing
        let tx = Transaction::new("mallory".into(), "bob".into(), 1, "sig");
        assert!(state.apply(&tx).is_err());
    }

    #[test]
    fn test_self_transfer_is_noop() {
        let state = funded("alice", 10);
        let tx = Transaction::new("alice".into(), "alice".into(), 10, "sig");

        assert_eq!(state.apply(&tx).unwrap(), state);
    }

    #[test]
    fn test_zero_value_transfer_from_unknown_origin() {
        let state = StateStore::new();
        let tx = Transaction::new("ghost".into(), "bob".into(), 0, "sig");

        let next = state.apply(&tx).unwrap();
        assert!(next.get(&"ghost".into()).is_none());
        assert_eq!(next.account(&"bob".into()), Account::new("bob".into()));
    }

    #[test]
    fn test_apply_preserves_nonce() {
        let mut accounts = BTreeMap::new();
        let mut alice = Account::with_balance("alice".into(), 50);
        alice.nonce = 7;
        accounts.insert(alice.address.clone(), alice);
        let state = StateStore::from(accounts);

        let next = state
            .apply(&Transaction::new("alice".into(), "bob".into(), 5, "sig"))
            .unwrap();
        assert_eq!(next.account(&"alice".into()).nonce, 7);
    }

    #[test]
    fn test_reward_mints_without_debit() {
        let state = StateStore::new();
        let next = state.apply(&Transaction::reward("miner".into(), 50)).unwrap();

        assert_eq!(next.balance(&"miner".into()), 50);
        assert!(next.get(&Address::reward_origin()).is_none());
        assert_eq!(next.total_supply(), 50);
    }

    #[test]
    fn test_apply_all_is_atomic() {
        let state = funded("alice", 100);
        let batch = vec![
            Transaction::new("alice".into(), "bob".into(), 60, "sig"),
            Transaction::new("bob".into(), "carol".into(), 10, "sig"),
            Transaction::new("alice".into(), "carol".into(), 60, "sig"),
        ];

        let err = state.apply_all(&batch).unwrap_err();
        assert!(matches!(err, StateError::InsufficientBalance { required: 60, available: 40, .. }));
        assert_eq!(state, funded("alice", 100));

        let next = state.apply_all(&batch[..2]).unwrap();
        assert_eq!(next.balance(&"alice".into()), 40);
        assert_eq!(next.balance(&"bob".into()), 50);
        assert_eq!(next.balance(&"carol".into()), 10);
        assert_eq!(next.total_supply(), 100);
    }

    #[test]
    fn test_apply_all_empty_batch() {
        let state = funded("alice", 1);
        assert_eq!(state.apply_all(std::iter::empty()).unwrap(), state);
    }

    #[test]
    fn test_state_serializes_as_map() {
        let state = funded("alice", 5);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["alice"]["balance"], 5);

        let decoded: StateStore = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, state);
    }
}
