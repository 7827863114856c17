//! Integration tests for the batched account refresh pipeline
//!
//! Key behaviors tested:
//! - contiguous near-equal batches, every address exactly once
//! - a failure stops its own batch only, and the run still reports it
//! - directory and snapshot are persisted before any per-account work
//! - vesting and balance refreshers write through to SQLite

mod common;

#[cfg(test)]
mod refresh_pipeline_tests {
    use super::common::{
        addresses, store_at, ts, RecordingRefresher, StaticChainSource, BASE_ACCOUNT, DENOM,
        MODULE_ACCOUNT,
    };
    use std::collections::HashSet;
    use std::sync::Arc;
    use supplyflow::db::{AccountDirectory, SqliteStore, VestingStore};
    use supplyflow::refresh::{BalanceRefresher, VestingRefresher};
    use supplyflow::types::{
        AccountBalance, ChainAccount, Coin, DecCoin, VestingAccount, VestingSchedule,
    };
    use supplyflow::{
        AccountRefreshPipeline, AccountRefresher, PipelineError, RefresherChain, VestingLedger,
    };

    fn chain_with_accounts(count: usize) -> StaticChainSource {
        addresses(count)
            .into_iter()
            .fold(StaticChainSource::new(), |source, address| {
                source.with_account(ChainAccount::plain(address, BASE_ACCOUNT))
            })
    }

    fn pipeline(
        store: &SqliteStore,
        source: StaticChainSource,
        refresher: Arc<dyn AccountRefresher>,
        batch_count: usize,
    ) -> AccountRefreshPipeline {
        AccountRefreshPipeline::new(
            Arc::new(store.clone()),
            Arc::new(source),
            Arc::new(store.clone()),
            refresher,
            batch_count,
        )
    }

    #[tokio::test]
    async fn test_23_accounts_in_5_batches() {
        let store = store_at(50, ts(1_000)).await;
        let refresher = Arc::new(RecordingRefresher::default());

        let report = pipeline(&store, chain_with_accounts(23), refresher.clone(), 5)
            .run()
            .await
            .unwrap();

        assert_eq!(report.height, 50);
        assert_eq!(report.total_accounts, 23);
        assert_eq!(report.refreshed, 23);
        let sizes: Vec<usize> = report.batches.iter().map(|b| b.refreshed).collect();
        assert_eq!(sizes, vec![5, 5, 5, 4, 4]);
        assert!(report.batches.iter().all(|b| b.error.is_none()));

        // Every address exactly once
        let mut refreshed = refresher.refreshed();
        assert_eq!(refreshed.len(), 23);
        refreshed.sort();
        assert_eq!(refreshed, addresses(23));
    }

    #[tokio::test]
    async fn test_failure_stops_only_its_batch() {
        let store = store_at(50, ts(1_000)).await;
        // Account #14 sits in the third batch (addr11..=addr15)
        let refresher = Arc::new(RecordingRefresher::failing_on(&["addr14"]));
        let pipeline = pipeline(&store, chain_with_accounts(23), refresher.clone(), 5);

        let report = pipeline.run().await.unwrap();
        assert_eq!(report.refreshed, 21);
        assert_eq!(report.batches[2].refreshed, 3);
        assert_eq!(report.batches[2].error.as_ref().and_then(|e| e.batch_index()), Some(2));
        for (index, batch) in report.batches.iter().enumerate() {
            if index != 2 {
                assert!(batch.error.is_none(), "batch {} should have succeeded", index);
            }
        }

        let attempted: HashSet<String> = refresher.attempted().into_iter().collect();
        assert!(attempted.contains("addr14"));
        assert!(!attempted.contains("addr15"));

        let refreshed: HashSet<String> = refresher.refreshed().into_iter().collect();
        let expected: HashSet<String> = addresses(23)
            .into_iter()
            .filter(|a| a != "addr14" && a != "addr15")
            .collect();
        assert_eq!(refreshed, expected);

        // The scheduler entry point surfaces the same failure
        let err = pipeline.refresh_all_accounts().await.unwrap_err();
        match err {
            PipelineError::Batch { index, address, .. } => {
                assert_eq!(index, 2);
                assert_eq!(address, "addr14");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_first_error_is_lowest_batch() {
        let store = store_at(50, ts(1_000)).await;
        let refresher = Arc::new(RecordingRefresher::failing_on(&["addr22", "addr03"]));

        let err = pipeline(&store, chain_with_accounts(23), refresher, 5)
            .refresh_all_accounts()
            .await
            .unwrap_err();
        assert_eq!(err.batch_index(), Some(0));
    }

    #[tokio::test]
    async fn test_directory_persisted_before_refresh() {
        let store = store_at(7, ts(1_000)).await;
        let refresher = Arc::new(RecordingRefresher::failing_on(&["addr01", "addr02", "addr03"]));

        let result = pipeline(&store, chain_with_accounts(3), refresher, 5)
            .refresh_all_accounts()
            .await;
        assert!(result.is_err());

        // Every batch failed on its only account, the directory is still complete
        assert_eq!(store.accounts().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_accounts_is_not_an_error() {
        let store = store_at(7, ts(1_000)).await;
        let refresher = Arc::new(RecordingRefresher::default());

        let report = pipeline(&store, StaticChainSource::new(), refresher.clone(), 5)
            .run()
            .await
            .unwrap();
        assert_eq!(report.total_accounts, 0);
        assert!(report.batches.is_empty());
        assert!(refresher.attempted().is_empty());
    }

    #[tokio::test]
    async fn test_vesting_and_balances_written_through() {
        let store = store_at(120, ts(1_500)).await;

        let vesting = VestingAccount::Continuous(VestingSchedule {
            address: "empe1vest".to_string(),
            original_vesting: vec![Coin::new(DENOM, 4_000)],
            start_time: ts(1_000),
            end_time: ts(2_000),
        });
        let source = StaticChainSource::new()
            .with_account(ChainAccount::plain("empe1user", BASE_ACCOUNT))
            .with_account(ChainAccount::plain("empe1distribution", MODULE_ACCOUNT))
            .with_account(ChainAccount::vesting(
                "/cosmos.vesting.v1beta1.ContinuousVestingAccount",
                vesting.clone(),
            ))
            .with_balance(
                "empe1user",
                AccountBalance {
                    available: vec![Coin::new(DENOM, 100), Coin::new("uother", 7)],
                    delegated: vec![Coin::new(DENOM, 40)],
                    unbonding: vec![Coin::new(DENOM, 5)],
                    rewards: vec![DecCoin::new(DENOM, "2.9".parse().unwrap())],
                },
            )
            .with_balance(
                "empe1distribution",
                AccountBalance {
                    available: vec![Coin::new(DENOM, 9_000)],
                    ..AccountBalance::default()
                },
            );
        let source = Arc::new(source);

        let ledger = VestingLedger::new(Arc::new(store.clone()), DENOM);
        let directory: Arc<dyn AccountDirectory> = Arc::new(store.clone());
        let vesting_refresher: Arc<dyn AccountRefresher> =
            Arc::new(VestingRefresher::new(source.clone(), ledger.clone()));
        let balance_refresher: Arc<dyn AccountRefresher> =
            Arc::new(BalanceRefresher::new(source.clone(), directory.clone(), DENOM));
        let refresher = Arc::new(RefresherChain::new(vec![vesting_refresher, balance_refresher]));

        let pipeline = AccountRefreshPipeline::new(
            Arc::new(store.clone()),
            source.clone(),
            directory,
            refresher,
            2,
        );
        pipeline.refresh_all_accounts().await.unwrap();

        assert_eq!(store.vesting_accounts().await.unwrap(), vec![vesting]);
        assert_eq!(ledger.sum_locked_at(ts(1_500)).await.unwrap(), 2_000);

        assert_eq!(store.sum_by_type(MODULE_ACCOUNT).await.unwrap(), 9_000);
        // Rewards are truncated toward zero
        assert_eq!(store.sum_by_type(BASE_ACCOUNT).await.unwrap(), 147);
        assert_eq!(
            store
                .sum_available_for(&["empe1user".to_string(), "empe1distribution".to_string()])
                .await
                .unwrap(),
            9_100
        );

        // Every chain query was pinned to the indexed height
        assert!(source.queried_heights().iter().all(|h| *h == 120));
    }
}
