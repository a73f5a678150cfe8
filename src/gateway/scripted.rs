//! In-memory gateway driven by a script
//!
//! Block heights are handed out from a queue (the last one repeats once the
//! queue drains). Account states and get-method answers are keyed by the block
//! they become visible at, and a read at block `n` sees the latest entry at or
//! below `n`. Every broadcast is recorded.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    AccountState, BlockHeight, GatewayError, LedgerGateway, StackValue, TransactionRecord,
    TxCheckpoint,
};
use crate::address::Address;

#[derive(Default)]
struct Script {
    heights: VecDeque<BlockHeight>,
    last_height: BlockHeight,
    accounts: BTreeMap<BlockHeight, AccountState>,
    methods: HashMap<String, BTreeMap<BlockHeight, Vec<StackValue>>>,
    queued_answers: HashMap<String, VecDeque<Result<Vec<StackValue>, GatewayError>>>,
    /// Full history, newest first
    history: Vec<TransactionRecord>,
    history_window: Option<usize>,
    broadcasts: Vec<Vec<u8>>,
    failing_broadcasts: usize,
    failing_height_reads: usize,
}

/// Scriptable [`LedgerGateway`] for tests and dry runs
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    /// Empty script: height 0, no accounts, no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Heights returned by successive `current_block_height` calls
    pub fn with_heights<I: IntoIterator<Item = BlockHeight>>(self, heights: I) -> Self {
        self.script.lock().heights.extend(heights);
        self
    }

    /// Account state visible from `block` onwards
    pub fn with_account(self, block: BlockHeight, state: AccountState) -> Self {
        self.script.lock().accounts.insert(block, state);
        self
    }

    /// Get-method answer visible from `block` onwards
    pub fn with_method(self, block: BlockHeight, method: &str, stack: Vec<StackValue>) -> Self {
        self.script
            .lock()
            .methods
            .entry(method.to_string())
            .or_default()
            .insert(block, stack);
        self
    }

    /// Queue one answer for `method`; queued answers are consumed in order
    /// before falling back to block-keyed ones
    pub fn push_answer(&self, method: &str, answer: Result<Vec<StackValue>, GatewayError>) {
        self.script
            .lock()
            .queued_answers
            .entry(method.to_string())
            .or_default()
            .push_back(answer);
    }

    /// Append a transaction as the newest history entry, chained to the
    /// previous newest one
    pub fn push_transaction(&self, mut tx: TransactionRecord) {
        let mut script = self.script.lock();
        tx.prev = script.history.first().map(TransactionRecord::checkpoint);
        script.history.insert(0, tx);
    }

    /// Cap how many transactions one history read returns
    pub fn with_history_window(self, window: usize) -> Self {
        self.script.lock().history_window = Some(window);
        self
    }

    /// Make the next `count` broadcasts fail after being recorded
    pub fn fail_broadcasts(&self, count: usize) {
        self.script.lock().failing_broadcasts = count;
    }

    /// Make the next `count` height reads fail
    pub fn fail_height_reads(&self, count: usize) {
        self.script.lock().failing_height_reads = count;
    }

    /// Every payload broadcast so far, failed ones included
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.script.lock().broadcasts.clone()
    }

    /// Number of broadcasts so far
    pub fn broadcast_count(&self) -> usize {
        self.script.lock().broadcasts.len()
    }
}

#[async_trait]
impl LedgerGateway for ScriptedGateway {
    async fn broadcast(&self, payload: &[u8]) -> Result<(), GatewayError> {
        let mut script = self.script.lock();
        script.broadcasts.push(payload.to_vec());
        if script.failing_broadcasts > 0 {
            script.failing_broadcasts -= 1;
            return Err(GatewayError::Transport("scripted broadcast failure".into()));
        }
        Ok(())
    }

    async fn current_block_height(&self) -> Result<BlockHeight, GatewayError> {
        let mut script = self.script.lock();
        if script.failing_height_reads > 0 {
            script.failing_height_reads -= 1;
            return Err(GatewayError::Transport("scripted height failure".into()));
        }
        if let Some(next) = script.heights.pop_front() {
            script.last_height = next;
        }
        Ok(script.last_height)
    }

    async fn read_account_state(
        &self,
        block: BlockHeight,
        _address: &Address,
    ) -> Result<AccountState, GatewayError> {
        let script = self.script.lock();
        Ok(script
            .accounts
            .range(..=block)
            .next_back()
            .map(|(_, state)| state.clone())
            .unwrap_or_else(AccountState::nonexistent))
    }

    async fn call_read_only(
        &self,
        block: BlockHeight,
        _address: &Address,
        method: &str,
        _args: &[StackValue],
    ) -> Result<Vec<StackValue>, GatewayError> {
        let mut script = self.script.lock();
        if let Some(answer) = script
            .queued_answers
            .get_mut(method)
            .and_then(|queue| queue.pop_front())
        {
            return answer;
        }
        script
            .methods
            .get(method)
            .and_then(|by_block| by_block.range(..=block).next_back())
            .map(|(_, stack)| stack.clone())
            .ok_or_else(|| GatewayError::MethodFailed {
                method: method.to_string(),
                exit_code: 11,
            })
    }

    async fn read_recent_transactions(
        &self,
        _address: &Address,
        since: &TxCheckpoint,
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRecord>, GatewayError> {
        let script = self.script.lock();
        let start = script
            .history
            .iter()
            .position(|tx| tx.checkpoint() == *since)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown transaction at lt {}", since.lt)))?;

        let window = match (limit, script.history_window) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => usize::MAX,
        };
        Ok(script.history[start..].iter().take(window).cloned().collect())
    }
}
