//! Connection failure handling, driven by the in-memory connector

use std::time::{Duration, Instant};

use futures::future::join_all;
use sqlx_replica_pool::{MockConnector, PoolConfig};
use sqlx_replica_router::{
   ConnectionPool, Error, Intent, PoolIdentifier, ReplicaPools, RoutingDataSource,
};

type MockDataSource = RoutingDataSource<ReplicaPools<MockConnector>>;

fn data_source(max_connections: u32) -> (MockDataSource, MockConnector, MockConnector) {
   let _ = tracing_subscriber::fmt().with_test_writer().try_init();

   let config = PoolConfig {
      max_connections,
      acquire_timeout: Duration::from_millis(100),
      ..Default::default()
   };

   let primary = MockConnector::new();
   let replica = MockConnector::new();
   let pools = ReplicaPools::new(
      ConnectionPool::new("primary", primary.clone(), config.clone()).unwrap(),
      ConnectionPool::new("replica", replica.clone(), config).unwrap(),
   );

   (RoutingDataSource::new(pools), primary, replica)
}

#[tokio::test]
async fn test_transactions_begin_with_matching_mode() {
   let (ds, primary, replica) = data_source(2);

   let mut tx = ds.begin_transaction(Intent::ReadOnly);
   let (read_only, in_transaction) = ds
      .execute(&mut tx, |conn| {
         Box::pin(async move { Ok::<_, Error>((conn.read_only(), conn.in_transaction())) })
      })
      .await
      .unwrap();
   assert!(read_only);
   assert!(in_transaction);
   ds.commit(&mut tx).await.unwrap();

   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   let read_only = ds
      .execute(&mut tx, |conn| Box::pin(async move { Ok::<_, Error>(conn.read_only()) }))
      .await
      .unwrap();
   assert!(!read_only);
   ds.rollback(&mut tx).await.unwrap();

   assert_eq!(replica.commits(), 1);
   assert_eq!(primary.rollbacks(), 1);
   assert_eq!(primary.commits(), 0);
}

#[tokio::test]
async fn test_dead_connection_mid_transaction_is_evicted() {
   let (ds, primary, _replica) = data_source(2);

   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   ds.execute(&mut tx, |conn| {
      Box::pin(async move {
         conn.execute("UPDATE stock SET qty = qty - 1")?;
         Ok::<_, Error>(())
      })
   })
   .await
   .unwrap();

   primary.kill_all();

   let err = ds
      .execute(&mut tx, |conn| {
         Box::pin(async move {
            conn.execute("INSERT INTO orders VALUES (1)")?;
            Ok::<_, Error>(())
         })
      })
      .await
      .unwrap_err();

   assert_eq!(err.error_code(), "CONNECTION_DEAD");
   assert!(tx.is_closed());
   assert!(!tx.is_bound());

   // Nothing left to commit; the attempt still releases the context
   let err = ds.commit(&mut tx).await.unwrap_err();
   assert!(matches!(err, Error::TransactionClosed { .. }));
   assert!(matches!(
      ds.rollback(&mut tx).await,
      Err(Error::DoubleRelease { .. })
   ));

   let status = ds.pool_status(PoolIdentifier::Primary);
   assert_eq!(status.checked_out, 0);
   assert_eq!(status.live, 0);
   assert_eq!(status.total_evicted, 1);

   // The pool recovers with a fresh connection
   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   ds.execute(&mut tx, |conn| {
      Box::pin(async move {
         conn.execute("INSERT INTO orders VALUES (1)")?;
         Ok::<_, Error>(())
      })
   })
   .await
   .unwrap();
   ds.commit(&mut tx).await.unwrap();
   assert_eq!(primary.opened(), 2);
}

#[tokio::test]
async fn test_dead_idle_connection_retried_before_begin() {
   let (ds, primary, _replica) = data_source(2);
   assert_eq!(ds.pools().primary().warmup(1).await.unwrap(), 1);

   // Below the validation threshold, so the dead connection is handed out unprobed
   primary.kill_all();

   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   let id = ds
      .execute(&mut tx, |conn| Box::pin(async move { Ok::<_, Error>(conn.id()) }))
      .await
      .unwrap();
   ds.commit(&mut tx).await.unwrap();

   assert_eq!(id, 1);
   assert_eq!(primary.opened(), 2);
   assert_eq!(ds.pool_status(PoolIdentifier::Primary).total_evicted, 1);
}

#[tokio::test]
async fn test_unreachable_replica_does_not_fall_back() {
   let (ds, primary, replica) = data_source(2);
   replica.fail_connects(true);

   let mut tx = ds.begin_transaction(Intent::ReadOnly);
   let err = ds
      .execute(&mut tx, |_conn| Box::pin(async move { Ok::<_, Error>(()) }))
      .await
      .unwrap_err();

   assert!(matches!(err, Error::Pool(_)));
   assert!(tx.is_closed());
   assert_eq!(primary.opened(), 0);
   assert_eq!(ds.pool_status(PoolIdentifier::Replica).checked_out, 0);

   // The usual cleanup path succeeds once
   ds.rollback(&mut tx).await.unwrap();
   let err = ds.rollback(&mut tx).await.unwrap_err();
   assert_eq!(err.error_code(), "DOUBLE_RELEASE");
}

#[tokio::test]
async fn test_retry_before_begin_shares_acquire_timeout() {
   let (ds, primary, _replica) = data_source(2);
   ds.pools().primary().warmup(1).await.unwrap();

   // The idle connection fails BEGIN and its replacement connects too slowly
   primary.kill_all();
   primary.set_connect_delay(Duration::from_millis(1500));

   let started = Instant::now();
   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   let err = ds
      .execute(&mut tx, |_conn| Box::pin(async move { Ok::<_, Error>(()) }))
      .await
      .unwrap_err();

   assert_eq!(err.error_code(), "POOL_EXHAUSTED");
   assert!(started.elapsed() < Duration::from_secs(1));
   assert!(tx.is_closed());

   let status = ds.pool_status(PoolIdentifier::Primary);
   assert_eq!((status.live, status.checked_out), (0, 0));
}

#[tokio::test]
async fn test_autocommit_routes_to_primary() {
   let (ds, primary, replica) = data_source(2);

   let in_transaction = ds
      .execute_autocommit(|conn| {
         Box::pin(async move {
            conn.execute("INSERT INTO audit VALUES (1)")?;
            Ok::<_, Error>(conn.in_transaction())
         })
      })
      .await
      .unwrap();

   assert!(!in_transaction);
   assert_eq!(primary.opened(), 1);
   assert_eq!(replica.opened(), 0);

   let status = ds.pool_status(PoolIdentifier::Primary);
   assert_eq!((status.checked_out, status.idle), (0, 1));
   assert_eq!(primary.commits(), 0);
}

#[tokio::test]
async fn test_autocommit_evicts_dead_connection() {
   let (ds, primary, _replica) = data_source(2);
   ds.pools().primary().warmup(1).await.unwrap();
   primary.kill_all();

   let err = ds
      .execute_autocommit(|conn| {
         Box::pin(async move {
            conn.execute("DELETE FROM sessions")?;
            Ok::<_, Error>(())
         })
      })
      .await
      .unwrap_err();

   assert!(err.is_connection_dead());
   let status = ds.pool_status(PoolIdentifier::Primary);
   assert_eq!((status.live, status.total_evicted), (0, 1));
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
   let (ds, primary, _replica) = data_source(1);

   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   ds.execute(&mut tx, |conn| {
      Box::pin(async move {
         conn.execute("DELETE FROM carts")?;
         Ok::<_, Error>(())
      })
   })
   .await
   .unwrap();
   drop(tx);

   for _ in 0..50 {
      if primary.rollbacks() == 1 && ds.pool_status(PoolIdentifier::Primary).idle == 1 {
         break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   assert_eq!(primary.rollbacks(), 1);

   // The slot is free again
   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   let in_transaction = ds
      .execute(&mut tx, |conn| Box::pin(async move { Ok::<_, Error>(conn.in_transaction()) }))
      .await
      .unwrap();
   assert!(in_transaction);
   ds.commit(&mut tx).await.unwrap();
   assert_eq!(primary.opened(), 1);
}

#[tokio::test]
async fn test_commit_on_dead_connection_evicts() {
   let (ds, primary, _replica) = data_source(2);

   let mut tx = ds.begin_transaction(Intent::ReadWrite);
   ds.execute(&mut tx, |_conn| Box::pin(async move { Ok::<_, Error>(()) }))
      .await
      .unwrap();
   primary.kill_all();

   let err = ds.commit(&mut tx).await.unwrap_err();
   assert!(err.is_connection_dead());
   assert!(tx.is_closed());

   let status = ds.pool_status(PoolIdentifier::Primary);
   assert_eq!(status.checked_out, 0);
   assert_eq!(status.total_evicted, 1);
}

#[tokio::test]
async fn test_scoped_transaction_with_dead_connection() {
   let (ds, primary, _replica) = data_source(2);
   let killer = primary.clone();

   let err = ds
      .transaction(Intent::ReadWrite, move |_conn| {
         Box::pin(async move {
            killer.kill_all();
            Err::<(), _>(Error::Other("business rule violated".into()))
         })
      })
      .await
      .unwrap_err();

   // The failed probe after the error closes the transaction as dead
   assert_eq!(err.error_code(), "CONNECTION_DEAD");
   assert_eq!(ds.pool_status(PoolIdentifier::Primary).checked_out, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transactions_respect_pool_bounds() {
   let (ds, primary, replica) = data_source(3);

   let ds = &ds;
   let tasks = (0..24).map(move |i| {
      async move {
         let intent = if i % 3 == 0 {
            Intent::ReadWrite
         } else {
            Intent::ReadOnly
         };
         let mut tx = ds.begin_transaction(intent);
         ds.execute(&mut tx, |conn| {
            Box::pin(async move {
               tokio::time::sleep(Duration::from_millis(5)).await;
               conn.execute("SELECT 1")?;
               Ok::<_, Error>(())
            })
         })
         .await?;
         ds.commit(&mut tx).await
      }
   });

   // Acquire timeout is generous relative to the work, so everything completes
   for result in join_all(tasks).await {
      result.unwrap();
   }

   assert!(primary.opened() <= 3);
   assert!(replica.opened() <= 3);
   assert_eq!(ds.pool_status(PoolIdentifier::Primary).total_acquired, 8);
   assert_eq!(ds.pool_status(PoolIdentifier::Replica).total_acquired, 16);
   assert_eq!(primary.commits() + replica.commits(), 24);
}
