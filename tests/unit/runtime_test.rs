//! Tests for runtime helpers

use training_coordinator::core::CoordinatorError;
use training_coordinator::runtime::api::ApiError;
use training_coordinator::runtime::tokio_spawner::{Spawn, TokioSpawner};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_owned_runtime_spawner() {
    let spawner = TokioSpawner::with_worker_threads(1).expect("runtime");
    let (tx, rx) = std::sync::mpsc::channel();
    spawner.spawn(async move {
        tx.send(7).unwrap();
    });
    assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 7);
}

#[test]
fn test_api_error_status_mapping() {
    let cases = [
        (CoordinatorError::NotFound("x".into()), 404),
        (CoordinatorError::Conflict("x".into()), 409),
        (
            CoordinatorError::QuotaExceeded {
                requested: 2,
                remaining: 1,
            },
            422,
        ),
        (CoordinatorError::BadInput("x".into()), 400),
        (CoordinatorError::TransientStore("x".into()), 503),
        (CoordinatorError::ExternalService("x".into()), 503),
        (CoordinatorError::Backend("x".into()), 500),
    ];
    for (err, status) in cases {
        let message = err.to_string();
        let api: ApiError = err.into();
        assert_eq!(api.status, status);
        assert_eq!(api.message, message);
    }
}

#[test]
fn test_health() {
    assert!(training_coordinator::runtime::health().ok);
}
