//! End-to-end client behavior against an in-process scripted server.

mod support;

use std::time::Duration;

use pretty_assertions::assert_eq;
use support::{ServerConfig, TestServer};
use weft::mysql::{Conn, Pool};
use weft::opts::PoolOpts;
use weft::promise::{PromiseState, delay};
use weft::runtime::EventLoop;
use weft::{Error, Opts};

fn opts_for(server: &TestServer) -> Opts {
    let mut opts = Opts::default();
    opts.host = "127.0.0.1".to_string();
    opts.port = server.addr.port();
    opts.user = "app".to_string();
    opts.password = Some("secret".to_string());
    opts
}

#[test]
fn connects_and_authenticates_with_native_password() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let mut opts = opts_for(&server);
    opts.init_command = Some("SET NAMES utf8mb4".to_string());
    let version = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let version = conn.server_version();
            conn.close().await.ok();
            Ok::<_, Error>(version)
        })
        .unwrap()
        .unwrap();
    assert_eq!(version, Some("8.0.35-test".to_string()));

    // the init command ran before the connection was handed out
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(server.logged(), vec!["SET NAMES utf8mb4".to_string()]);
}

#[test]
fn authenticates_through_an_auth_switch() {
    let server = TestServer::start(ServerConfig {
        auth_switch: true,
        ..ServerConfig::default()
    });
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    let connected = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let usable = conn.is_usable();
            conn.close().await.ok();
            Ok::<_, Error>(usable)
        })
        .unwrap()
        .unwrap();
    assert!(connected);
}

#[test]
fn wrong_password_is_an_auth_error() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let mut opts = opts_for(&server);
    opts.password = Some("wrong".to_string());
    let outcome = event_loop
        .block_on(async move { Conn::connect(&handle, opts).await })
        .unwrap();
    assert!(matches!(outcome, Err(Error::Auth(_))));
}

#[test]
fn query_reads_the_full_result_set() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    let result = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let result = conn.query("SELECT id, name FROM users").await?;
            conn.close().await.ok();
            Ok::<_, Error>(result)
        })
        .unwrap()
        .unwrap();

    assert_eq!(result.columns.len(), 2);
    assert_eq!(result.columns[0].name, "id");
    assert_eq!(result.columns[1].name, "name");
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get_named("id").unwrap().as_i64(), Some(1));
    assert_eq!(result.rows[0].get_named("name").unwrap().as_str(), Some("ada"));
    assert_eq!(result.rows[1].get_named("name").unwrap().as_str(), Some("grace"));
}

#[test]
fn server_error_fails_the_command_but_not_the_connection() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    let (bad, good_rows) = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let bad = conn.query("BAD SYNTAX").await;
            let good = conn.query("SELECT id, name FROM users").await?;
            conn.close().await.ok();
            Ok::<_, Error>((bad.err(), good.rows.len()))
        })
        .unwrap()
        .unwrap();

    assert!(matches!(bad, Some(Error::Server { code: 1064, .. })));
    assert_eq!(good_rows, 2);
}

#[test]
fn connection_loss_rejects_inflight_and_queued_commands() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    let (first, second, broken) = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let dying = conn.query("SELECT DIE");
            let queued = conn.query("SELECT id, name FROM users");
            let first = dying.await.err();
            let second = queued.await.err();
            Ok::<_, Error>((first, second, conn.is_broken()))
        })
        .unwrap()
        .unwrap();

    assert!(matches!(first, Some(Error::ConnectionLost)));
    assert!(matches!(second, Some(Error::ConnectionLost)));
    assert!(broken);
}

#[test]
fn prepared_statements_round_trip_binary_rows() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    let value = event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            let stmt = conn.prepare("SELECT n FROM t WHERE id = ?").await?;
            assert_eq!(stmt.param_count(), 1);
            assert_eq!(stmt.column_count(), 1);

            let result = stmt.exec(vec![5i64.into()]).await?;
            let value = result.rows[0].get(0).unwrap().as_i64();

            // wrong arity is rejected locally
            let arity = stmt.exec(vec![]).await;
            assert!(matches!(arity, Err(Error::BadConfig(_))));

            stmt.close();
            conn.close().await.ok();
            Ok::<_, Error>(value)
        })
        .unwrap()
        .unwrap();
    assert_eq!(value, Some(7));

    // STMT_CLOSE has no response; give the server thread a moment to log it
    std::thread::sleep(Duration::from_millis(100));
    let log = server.logged();
    assert!(log.iter().any(|l| l.starts_with("PREPARE")));
    assert!(log.iter().any(|l| l == "EXECUTE"));
    assert!(log.iter().any(|l| l == "STMT_CLOSE"));
}

#[test]
fn prepared_statement_pins_its_pooled_connection() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 1 });
    event_loop
        .block_on({
            let pool = pool.clone();
            async move {
                let stmt = {
                    let conn = pool.acquire().await?;
                    conn.prepare("SELECT n FROM t WHERE id = ?").await?
                };
                // the checkout guard is gone, but the open statement keeps
                // the connection out of the pool
                delay(Duration::from_millis(10)).await.ok();
                assert_eq!(pool.idle_count(), 0, "pinned connection was parked");
                assert_eq!(pool.connection_count(), 1);

                let waiter = pool.acquire();
                delay(Duration::from_millis(10)).await.ok();
                assert_eq!(
                    waiter.state(),
                    PromiseState::Pending,
                    "waiter got a pinned connection"
                );

                // and the statement still drives it
                let result = stmt.exec(vec![1i64.into()]).await?;
                assert_eq!(result.rows[0].get(0).unwrap().as_i64(), Some(7));

                // closing the statement releases the pin to the waiter
                drop(stmt);
                let next = waiter.clone().await?;
                drop(next);
                drop(waiter);
                Ok::<_, Error>(())
            }
        })
        .unwrap()
        .unwrap();
    pool.close();
}

#[test]
fn pool_reuses_idle_connections_and_keeps_its_accounting() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 2 });
    let checks = {
        let pool = pool.clone();
        event_loop.block_on(async move {
            let a = pool.acquire().await?;
            let b = pool.acquire().await?;
            assert_eq!(pool.connection_count(), 2);
            assert_eq!(pool.in_use(), 2);
            assert_eq!(pool.idle_count(), 0);

            drop(a);
            delay(Duration::from_millis(10)).await.ok();
            assert_eq!(pool.connection_count(), 2);
            assert_eq!(pool.idle_count(), 1);

            let c = pool.acquire().await?;
            assert_eq!(pool.idle_count(), 0);
            drop(b);
            drop(c);
            Ok::<_, Error>(pool.connection_count())
        })
    };
    assert_eq!(checks.unwrap().unwrap(), 2);
    pool.close();
}

#[test]
fn pool_waiters_wake_in_fifo_order() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 1 });
    event_loop
        .block_on({
            let pool = pool.clone();
            async move {
                let held = pool.acquire().await?;

                let first_waiter = pool.acquire();
                let second_waiter = pool.acquire();
                assert_eq!(pool.waiter_count(), 2);

                drop(held);
                let first = first_waiter.clone().await?;
                assert_eq!(
                    second_waiter.state(),
                    PromiseState::Pending,
                    "second waiter served out of order"
                );

                drop(first);
                drop(first_waiter);
                let _second = second_waiter.clone().await?;
                assert_eq!(pool.waiter_count(), 0);
                Ok::<_, Error>(())
            }
        })
        .unwrap()
        .unwrap();
    pool.close();
}

#[test]
fn transaction_commit_releases_the_pinned_connection() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 1 });
    event_loop
        .block_on({
            let pool = pool.clone();
            async move {
                let tx = pool.begin().await?;
                tx.query_drop("INSERT INTO t (v) VALUES (1)").await?;
                tx.commit().await?;
                drop(tx);

                delay(Duration::from_millis(20)).await.ok();
                assert_eq!(pool.idle_count(), 1);
                Ok::<_, Error>(())
            }
        })
        .unwrap()
        .unwrap();

    let log = server.logged();
    assert_eq!(
        log,
        vec![
            "BEGIN".to_string(),
            "INSERT INTO t (v) VALUES (1)".to_string(),
            "COMMIT".to_string(),
        ]
    );
    pool.close();
}

#[test]
fn dropped_transaction_rolls_back_before_returning_the_connection() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 1 });
    event_loop
        .block_on({
            let pool = pool.clone();
            async move {
                {
                    let tx = pool.begin().await?;
                    tx.query_drop("INSERT INTO t (v) VALUES (2)").await?;
                    drop(tx);
                }
                // let the rollback drain through the connection queue
                delay(Duration::from_millis(30)).await.ok();
                assert_eq!(pool.idle_count(), 1, "connection not returned");

                // the next transaction sees a clean connection
                let tx = pool.begin().await?;
                tx.rollback().await?;
                Ok::<_, Error>(())
            }
        })
        .unwrap()
        .unwrap();

    let log = server.logged();
    assert_eq!(
        log[..3],
        [
            "BEGIN".to_string(),
            "INSERT INTO t (v) VALUES (2)".to_string(),
            "ROLLBACK".to_string(),
        ]
    );
    pool.close();
}

#[test]
fn pool_close_rejects_waiters() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let pool = Pool::new(&handle, opts_for(&server), PoolOpts { max_connections: 1 });
    event_loop
        .block_on({
            let pool = pool.clone();
            async move {
                let held = pool.acquire().await?;
                let waiter = pool.acquire();
                pool.close();

                let outcome = waiter.await;
                assert!(matches!(outcome, Err(Error::PoolClosing)));
                assert_eq!(pool.connection_count(), 0);

                let late = pool.acquire().await;
                assert!(matches!(late, Err(Error::PoolClosing)));
                drop(held);
                Ok::<_, Error>(())
            }
        })
        .unwrap()
        .unwrap();
}

#[test]
fn ping_round_trips() {
    let server = TestServer::start(ServerConfig::default());
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let opts = opts_for(&server);
    event_loop
        .block_on(async move {
            let conn = Conn::connect(&handle, opts).await?;
            conn.ping().await?;
            conn.close().await.ok();
            Ok::<_, Error>(())
        })
        .unwrap()
        .unwrap();
}
