//! Transaction applier
//!
//! Applies one signed transaction to a draft state. A state snapshot is taken
//! before execution; on any execution error the state is reverted to it, so a
//! failed application leaves the draft exactly as it was.

use crate::state::{StateError, WorldState};
use crate::types::{Address, Header, Log, Receipt, SignedTransaction, H256};

/// Base cost of every transaction
pub const TX_GAS: u64 = 21_000;
/// Cost per non-zero byte of payload
pub const TX_DATA_NON_ZERO_GAS: u64 = 68;
/// Cost per zero byte of payload
pub const TX_DATA_ZERO_GAS: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("gas limit reached: transaction wants {wanted}, block has {available} left")]
    GasLimitReached { wanted: u64, available: u64 },
    #[error("nonce too low: account at {expected}, transaction has {got}")]
    NonceTooLow { expected: u64, got: u64 },
    #[error("nonce too high: account at {expected}, transaction has {got}")]
    NonceTooHigh { expected: u64, got: u64 },
    #[error("intrinsic gas too low: need {needed}, limit {limit}")]
    IntrinsicGas { needed: u64, limit: u64 },
    #[error("insufficient funds: balance {balance}, cost {cost}")]
    InsufficientFunds { balance: u128, cost: u128 },
    #[error("invalid transaction signature")]
    InvalidSignature,
    #[error(transparent)]
    State(#[from] StateError),
}

impl ExecutionError {
    /// True when the block ran out of gas rather than the transaction being invalid
    pub fn is_gas_limit(&self) -> bool {
        matches!(self, ExecutionError::GasLimitReached { .. })
    }
}

/// Remaining gas budget of a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), ExecutionError> {
        if amount > self.0 {
            return Err(ExecutionError::GasLimitReached {
                wanted: amount,
                available: self.0,
            });
        }
        self.0 -= amount;
        Ok(())
    }
}

/// Gas charged before any execution happens
pub fn intrinsic_gas(data: &[u8]) -> u64 {
    data.iter().fold(TX_GAS, |gas, byte| {
        gas + if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NON_ZERO_GAS
        }
    })
}

/// Apply `tx` on top of `state` inside the block described by `header`.
///
/// On success the header's `gas_used` is advanced and the receipt plus emitted
/// logs are returned. On failure `state`, `header` and `gas_pool` are unchanged.
pub fn apply_transaction(
    state: &mut WorldState,
    header: &mut Header,
    gas_pool: &mut GasPool,
    tx: &SignedTransaction,
    tx_index: u32,
) -> Result<(Receipt, Vec<Log>), ExecutionError> {
    gas_pool.sub_gas(tx.gas_limit())?;

    let snapshot = state.snapshot();
    match execute(state, &header.coinbase, tx) {
        Ok(gas_used) => {
            state.commit();
            gas_pool.add_gas(tx.gas_limit() - gas_used);
            header.gas_used += gas_used;

            let tx_hash = tx.hash();
            let logs = emitted_logs(tx, tx_hash, header.number, tx_index);
            let receipt = Receipt::new(tx_hash, gas_used, header.gas_used, logs.clone());
            Ok((receipt, logs))
        }
        Err(e) => {
            state.revert_to_snapshot(snapshot);
            gas_pool.add_gas(tx.gas_limit());
            Err(e)
        }
    }
}

/// Run the state transition and return the gas used
fn execute(
    state: &mut WorldState,
    coinbase: &Address,
    tx: &SignedTransaction,
) -> Result<u64, ExecutionError> {
    tx.verify().map_err(|_| ExecutionError::InvalidSignature)?;

    let from = tx.sender();
    let body = &tx.tx;

    let expected = state.nonce(&from);
    if body.nonce < expected {
        return Err(ExecutionError::NonceTooLow {
            expected,
            got: body.nonce,
        });
    }
    if body.nonce > expected {
        return Err(ExecutionError::NonceTooHigh {
            expected,
            got: body.nonce,
        });
    }

    let needed = intrinsic_gas(&body.data);
    if body.gas_limit < needed {
        return Err(ExecutionError::IntrinsicGas {
            needed,
            limit: body.gas_limit,
        });
    }

    let balance = state.balance(&from);
    let upfront = (body.gas_limit as u128).checked_mul(body.gas_price);
    let cost = upfront.and_then(|u| u.checked_add(body.value));
    let (Some(upfront), Some(cost)) = (upfront, cost) else {
        return Err(ExecutionError::InsufficientFunds {
            balance,
            cost: u128::MAX,
        });
    };
    if balance < cost {
        return Err(ExecutionError::InsufficientFunds { balance, cost });
    }

    state.sub_balance(from, upfront)?;
    state.set_nonce(from, expected + 1);

    state.sub_balance(from, body.value)?;
    state.add_balance(body.to, body.value)?;

    let gas_used = needed;
    let refund = (body.gas_limit - gas_used) as u128 * body.gas_price;
    state.add_balance(from, refund)?;
    state.add_balance(*coinbase, gas_used as u128 * body.gas_price)?;

    Ok(gas_used)
}

fn emitted_logs(tx: &SignedTransaction, tx_hash: H256, block_number: u64, tx_index: u32) -> Vec<Log> {
    if tx.tx.data.is_empty() {
        return Vec::new();
    }
    vec![Log {
        address: tx.tx.to,
        topics: vec![H256::hash(&tx.tx.data)],
        data: tx.tx.data.clone(),
        block_hash: H256::zero(),
        block_number,
        tx_hash,
        tx_index,
        log_index: 0,
    }]
}

/// Re-execute a full block body on `state`, returning the receipts.
///
/// `header` is used as the execution context; its `gas_used` must start at zero.
pub fn execute_block(
    state: &mut WorldState,
    header: &mut Header,
    transactions: &[SignedTransaction],
) -> Result<Vec<Receipt>, ExecutionError> {
    let mut gas_pool = GasPool::new(header.gas_limit);
    let mut receipts = Vec::with_capacity(transactions.len());
    let mut log_index = 0u32;

    for (i, tx) in transactions.iter().enumerate() {
        let (mut receipt, _) = apply_transaction(state, header, &mut gas_pool, tx, i as u32)?;
        for log in receipt.logs.iter_mut() {
            log.log_index = log_index;
            log_index += 1;
        }
        receipts.push(receipt);
    }

    Ok(receipts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transaction;
    use ed25519_dalek::SigningKey;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn transfer(k: &SigningKey, nonce: u64, to: Address, value: u128) -> SignedTransaction {
        Transaction {
            nonce,
            gas_price: 2,
            gas_limit: 30_000,
            to,
            value,
            data: vec![],
        }
        .sign(k)
    }

    fn header() -> Header {
        Header {
            number: 1,
            gas_limit: 100_000,
            coinbase: Address([0xcb; 20]),
            ..Default::default()
        }
    }

    #[test]
    fn test_transfer_charges_gas_and_moves_value() {
        let k = key(1);
        let from = Address::from_signing_key(&k);
        let to = Address([2; 20]);
        let mut state = WorldState::from_alloc([(from, 1_000_000)]);
        let mut h = header();
        let mut pool = GasPool::new(h.gas_limit);

        let (receipt, logs) =
            apply_transaction(&mut state, &mut h, &mut pool, &transfer(&k, 0, to, 10), 0).unwrap();

        assert_eq!(receipt.gas_used, TX_GAS);
        assert!(logs.is_empty());
        assert_eq!(h.gas_used, TX_GAS);
        assert_eq!(pool.gas(), 100_000 - TX_GAS);
        assert_eq!(state.balance(&to), 10);
        assert_eq!(state.balance(&h.coinbase), TX_GAS as u128 * 2);
        assert_eq!(state.balance(&from), 1_000_000 - 10 - TX_GAS as u128 * 2);
        assert_eq!(state.nonce(&from), 1);
    }

    #[test]
    fn test_failure_after_mutation_reverts() {
        let k = key(1);
        let from = Address::from_signing_key(&k);
        let to = Address([2; 20]);
        // recipient overflow fails after the sender was already charged
        let mut state = WorldState::from_alloc([(from, 1_000_000), (to, u128::MAX)]);
        let before = state.encode_accounts();
        let mut h = header();
        let mut pool = GasPool::new(h.gas_limit);

        let err = apply_transaction(&mut state, &mut h, &mut pool, &transfer(&k, 0, to, 1), 0)
            .unwrap_err();

        assert!(matches!(err, ExecutionError::State(StateError::BalanceOverflow(_))));
        assert_eq!(state.encode_accounts(), before);
        assert_eq!(h.gas_used, 0);
        assert_eq!(pool.gas(), 100_000);
    }

    #[test]
    fn test_gas_limit_reached() {
        let k = key(1);
        let from = Address::from_signing_key(&k);
        let mut state = WorldState::from_alloc([(from, 1_000_000)]);
        let mut h = header();
        let mut pool = GasPool::new(20_000);

        let err = apply_transaction(&mut state, &mut h, &mut pool, &transfer(&k, 0, from, 0), 0)
            .unwrap_err();
        assert!(err.is_gas_limit());
        assert_eq!(pool.gas(), 20_000);
    }

    #[test]
    fn test_nonce_checks() {
        let k = key(1);
        let from = Address::from_signing_key(&k);
        let mut state = WorldState::from_alloc([(from, 1_000_000)]);
        let mut h = header();
        let mut pool = GasPool::new(h.gas_limit);

        let err = apply_transaction(&mut state, &mut h, &mut pool, &transfer(&k, 1, from, 0), 0)
            .unwrap_err();
        assert_eq!(err, ExecutionError::NonceTooHigh { expected: 0, got: 1 });
    }

    #[test]
    fn test_payload_emits_log() {
        let k = key(1);
        let from = Address::from_signing_key(&k);
        let mut state = WorldState::from_alloc([(from, 1_000_000)]);
        let mut h = header();
        let mut pool = GasPool::new(h.gas_limit);
        let tx = Transaction {
            nonce: 0,
            gas_price: 1,
            gas_limit: 30_000,
            to: Address([9; 20]),
            value: 0,
            data: vec![1, 0, 2],
        }
        .sign(&k);

        let (receipt, logs) = apply_transaction(&mut state, &mut h, &mut pool, &tx, 0).unwrap();
        assert_eq!(receipt.gas_used, TX_GAS + 2 * TX_DATA_NON_ZERO_GAS + TX_DATA_ZERO_GAS);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].topics[0], H256::hash(&[1, 0, 2]));
        assert!(receipt.bloom.contains(Address([9; 20]).as_bytes()));
    }
}
