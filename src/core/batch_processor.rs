//! Batch processing with product-based partitioning
//!
//! This module provides the `BatchProcessor` struct, which runs a batch of
//! ledger commands concurrently while producing exactly the ledger a
//! sequential replay of the same batch would.
//!
//! # Design
//!
//! Commands are partitioned by the product they touch. Purchases name their
//! product; every other command names a purchase, whose product is looked up
//! in the same batch first and then in the store. Inventory limits and
//! subscription changes are per product, so per-product ordering is all
//! most commands need.
//!
//! Some commands reach past their product:
//! - `team` marks the acting user as support staff for every seller
//! - `refunds_disabled` changes the seller of every product they own
//! - `upgrade=` / `resubscribe=` resolve a purchase that may belong to
//!   another product
//! - `charge=` joins a combined charge shared with other products
//!
//! Those, and commands whose purchase cannot be resolved yet, are barriers:
//! everything before them finishes, they run alone, then partitioning
//! resumes. A batch therefore becomes a sequence of [`Stage`]s.
//!
//! # Architecture
//!
//! ```text
//! BatchProcessor
//!     └── Arc<LedgerEngine>  (shared command processor)
//! ```

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use super::engine::LedgerEngine;
use crate::types::{CommandType, LedgerCommand, LedgerError, ProductId};
use tracing::{debug, error};

/// Result of processing a single command
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    /// The command that was processed
    pub command: LedgerCommand,

    /// The result of processing (success or error)
    pub result: Result<(), LedgerError>,
}

/// One step of a batch, run after the previous step completed
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Independent per-product command lists, each in original order
    Partitioned(HashMap<ProductId, Vec<LedgerCommand>>),
    /// A command that must see, and be seen by, every other product
    Alone(LedgerCommand),
}

/// Whether a command reads or writes state outside its own product
fn reaches_other_products(command: &LedgerCommand) -> bool {
    let flags = &command.flags;
    flags.team
        || (command.command == CommandType::Purchase
            && (flags.refunds_disabled || flags.plan_change.is_some() || flags.charge.is_some()))
}

/// Batch processor with product-based partitioning
///
/// Cloneable and shareable across tasks; every clone drives the same engine.
#[derive(Debug, Clone)]
pub struct BatchProcessor {
    engine: Arc<LedgerEngine>,
}

impl BatchProcessor {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    /// Product a command belongs to, if it can be determined yet
    fn product_of(
        &self,
        command: &LedgerCommand,
        products_in_batch: &mut HashMap<String, ProductId>,
    ) -> Option<ProductId> {
        match (command.command, command.product) {
            (CommandType::Purchase, Some(product)) => {
                products_in_batch.insert(command.purchase.clone(), product);
                Some(product)
            }
            _ => products_in_batch.get(&command.purchase).copied().or_else(|| {
                self.engine
                    .store()
                    .find_purchase(&command.purchase)
                    .ok()
                    .map(|purchase| purchase.product_id)
            }),
        }
    }

    /// Split a batch into stages
    ///
    /// # Returns
    ///
    /// Stages in execution order. Empty partitioned stages are omitted.
    pub fn split_into_stages(&self, batch: Vec<LedgerCommand>) -> Vec<Stage> {
        let mut products_in_batch: HashMap<String, ProductId> = HashMap::new();
        let mut stages = Vec::new();
        let mut partitions: HashMap<ProductId, Vec<LedgerCommand>> = HashMap::new();

        for command in batch {
            match self.product_of(&command, &mut products_in_batch) {
                Some(product) if !reaches_other_products(&command) => {
                    partitions.entry(product).or_default().push(command);
                }
                _ => {
                    if !partitions.is_empty() {
                        stages.push(Stage::Partitioned(mem::take(&mut partitions)));
                    }
                    stages.push(Stage::Alone(command));
                }
            }
        }
        if !partitions.is_empty() {
            stages.push(Stage::Partitioned(partitions));
        }

        stages
    }

    /// Process all commands of one product sequentially
    ///
    /// Failed commands are captured in their result and do not stop the rest.
    pub async fn process_product_commands(&self, commands: Vec<LedgerCommand>) -> Vec<ProcessingResult> {
        let mut results = Vec::with_capacity(commands.len());

        for command in commands {
            let result = self.engine.process(command.clone()).await;
            results.push(ProcessingResult { command, result });
        }

        results
    }

    /// Run every partition of a stage as its own task
    async fn process_partitions(
        &self,
        partitions: HashMap<ProductId, Vec<LedgerCommand>>,
    ) -> Vec<ProcessingResult> {
        let mut tasks = Vec::with_capacity(partitions.len());
        for (_product, commands) in partitions {
            let processor = self.clone();
            tasks.push(tokio::spawn(async move {
                processor.process_product_commands(commands).await
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            match task.await {
                Ok(product_results) => results.extend(product_results),
                Err(join_error) => error!(%join_error, "partition task panicked"),
            }
        }

        results
    }

    /// Process a batch stage by stage, one task per product within a stage
    ///
    /// Results may come back in a different order than the input.
    pub async fn process_batch(&self, batch: Vec<LedgerCommand>) -> Vec<ProcessingResult> {
        let mut results = Vec::with_capacity(batch.len());

        for stage in self.split_into_stages(batch) {
            match stage {
                Stage::Partitioned(partitions) => {
                    results.extend(self.process_partitions(partitions).await);
                }
                Stage::Alone(command) => {
                    debug!(purchase = %command.purchase, command = ?command.command, "running command alone");
                    results.extend(self.process_product_commands(vec![command]).await);
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChargeGroupId, CommandFlags, PlanChangeKind, PurchaseState, UserId};
    use rstest::rstest;
    use rust_decimal::Decimal;

    fn command(kind: CommandType, purchase: &str, product: Option<u64>) -> LedgerCommand {
        LedgerCommand {
            command: kind,
            purchase: purchase.to_string(),
            product: product.map(ProductId),
            seller: Some(UserId(1)),
            user: None,
            amount: (kind == CommandType::Purchase).then(|| Decimal::new(1000, 2)),
            tax: None,
            vat: None,
            fee: None,
            flags: CommandFlags::default(),
        }
    }

    fn processor() -> BatchProcessor {
        BatchProcessor::new(Arc::new(LedgerEngine::default()))
    }

    fn partitioned(stage: &Stage) -> &HashMap<ProductId, Vec<LedgerCommand>> {
        match stage {
            Stage::Partitioned(partitions) => partitions,
            Stage::Alone(command) => panic!("expected partitions, got {:?}", command),
        }
    }

    fn alone(stage: &Stage) -> &str {
        match stage {
            Stage::Alone(command) => &command.purchase,
            Stage::Partitioned(_) => panic!("expected a lone command"),
        }
    }

    #[test]
    fn test_split_empty_batch() {
        assert!(processor().split_into_stages(vec![]).is_empty());
    }

    #[test]
    fn test_partition_follows_purchase_product_within_batch() {
        let processor = processor();
        let batch = vec![
            command(CommandType::Purchase, "a", Some(1)),
            command(CommandType::Purchase, "b", Some(2)),
            command(CommandType::Refund, "a", None),
            command(CommandType::Refund, "b", None),
            command(CommandType::Sync, "a", None),
        ];

        let stages = processor.split_into_stages(batch);

        assert_eq!(stages.len(), 1);
        let partitions = partitioned(&stages[0]);
        assert_eq!(partitions.len(), 2);
        let first: Vec<_> = partitions[&ProductId(1)]
            .iter()
            .map(|command| (command.command, command.purchase.as_str()))
            .collect();
        assert_eq!(
            first,
            vec![
                (CommandType::Purchase, "a"),
                (CommandType::Refund, "a"),
                (CommandType::Sync, "a"),
            ]
        );
        assert_eq!(partitions[&ProductId(2)].len(), 2);
    }

    #[test]
    fn test_unknown_purchase_runs_alone() {
        let processor = processor();

        let stages = processor.split_into_stages(vec![
            command(CommandType::Purchase, "a", Some(1)),
            command(CommandType::Refund, "ghost", None),
            command(CommandType::Refund, "a", None),
        ]);

        assert_eq!(stages.len(), 3);
        assert_eq!(partitioned(&stages[0])[&ProductId(1)].len(), 1);
        assert_eq!(alone(&stages[1]), "ghost");
        assert_eq!(partitioned(&stages[2])[&ProductId(1)].len(), 1);
    }

    #[rstest]
    #[case::seller_flag(CommandType::Purchase, CommandFlags { refunds_disabled: true, ..CommandFlags::default() })]
    #[case::team_member(CommandType::Refund, CommandFlags { team: true, ..CommandFlags::default() })]
    #[case::upgrade(
        CommandType::Purchase,
        CommandFlags { plan_change: Some((PlanChangeKind::Upgrade, "a".to_string())), ..CommandFlags::default() }
    )]
    #[case::combined_charge(CommandType::Purchase, CommandFlags { charge: Some(ChargeGroupId(1)), ..CommandFlags::default() })]
    fn test_cross_product_command_is_a_barrier(#[case] kind: CommandType, #[case] flags: CommandFlags) {
        let processor = processor();
        let mut barrier = command(kind, if kind == CommandType::Purchase { "b" } else { "a" }, Some(2));
        barrier.flags = flags;

        let stages = processor.split_into_stages(vec![
            command(CommandType::Purchase, "a", Some(1)),
            barrier,
            command(CommandType::Sync, "a", None),
        ]);

        assert_eq!(stages.len(), 3);
        assert!(matches!(stages[1], Stage::Alone(_)));
        assert_eq!(partitioned(&stages[2])[&ProductId(1)].len(), 1);
    }

    #[tokio::test]
    async fn test_partition_uses_store_for_earlier_batches() {
        let processor = processor();
        processor
            .process_batch(vec![command(CommandType::Purchase, "a", Some(9))])
            .await;

        let stages = processor.split_into_stages(vec![command(CommandType::Refund, "a", None)]);

        assert_eq!(partitioned(&stages[0])[&ProductId(9)].len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_seller_flag_from_other_product_applies_before_later_refund() {
        for _ in 0..20 {
            let processor = processor();
            let mut disabling = command(CommandType::Purchase, "b", Some(2));
            disabling.flags.refunds_disabled = true;
            let batch = vec![
                command(CommandType::Purchase, "a", Some(1)),
                disabling,
                command(CommandType::Refund, "a", None),
            ];

            let results = processor.process_batch(batch).await;

            let refund = results
                .iter()
                .find(|result| result.command.command == CommandType::Refund)
                .unwrap();
            assert_eq!(refund.result, Err(LedgerError::RefundsDisabled));
            assert!(!processor.engine.store().find_purchase("a").unwrap().stripe_refunded);
        }
    }

    #[tokio::test]
    async fn test_process_batch_returns_every_result() {
        let processor = processor();
        let batch = vec![
            command(CommandType::Purchase, "a", Some(1)),
            command(CommandType::Purchase, "b", Some(2)),
            command(CommandType::Refund, "a", None),
            command(CommandType::Refund, "ghost", None),
        ];

        let results = processor.process_batch(batch).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|result| result.result.is_err()).count(), 1);
        let purchase = processor.engine.store().find_purchase("a").unwrap();
        assert_eq!(purchase.state, PurchaseState::Successful);
        assert!(purchase.stripe_refunded);
    }
}
