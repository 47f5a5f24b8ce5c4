use clients::ErrorKind;
use pretty_assertions::assert_eq as pretty_assert_eq;
use stow::{
    ReservationCoordinator, ReservationMode, TransferOptions,
    backend::{MemoryBackend, NoReservations},
};

use crate::context;

#[test_log::test(tokio::test)]
async fn concurrent_native_reservations_have_one_winner() {
    let backend = MemoryBackend::new();
    let context = context(TransferOptions::default());
    let first = ReservationCoordinator::new(backend.clone(), context.clone());
    let second = ReservationCoordinator::new(backend.clone(), context);

    let (a, b) = tokio::join!(
        first.reserve("k", &["/a", "/b"]),
        second.reserve("k", &["/a", "/b"]),
    );
    let results = [a, b];
    let granted = results.iter().filter(|result| result.is_ok()).count();
    let conflicts = results
        .iter()
        .filter_map(|result| result.as_ref().err())
        .filter(|err| ErrorKind::of(err) == ErrorKind::Conflict)
        .count();

    pretty_assert_eq!(granted, 1);
    pretty_assert_eq!(conflicts, 1);
    pretty_assert_eq!(backend.open_reservations(), 1);
}

#[test_log::test(tokio::test)]
async fn concurrent_reservations_across_tasks() {
    let backend = MemoryBackend::new();
    let context = context(TransferOptions::default());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let coordinator = ReservationCoordinator::new(backend.clone(), context.clone());
        tasks.spawn(async move { coordinator.reserve("k", &["/a"]).await });
    }

    let mut granted = 0;
    let mut conflicts = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => granted += 1,
            Err(err) if ErrorKind::of(&err) == ErrorKind::Conflict => conflicts += 1,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }
    pretty_assert_eq!(granted, 1);
    pretty_assert_eq!(conflicts, 7);
}

#[test_log::test(tokio::test)]
async fn storage_direct_grants_every_request() {
    let options = TransferOptions::builder()
        .reservation_mode(ReservationMode::StorageDirect)
        .build();
    let coordinator = ReservationCoordinator::new(NoReservations, context(options));

    let (a, b) = tokio::join!(
        coordinator.reserve("k", &["/a"]),
        coordinator.reserve("k", &["/a"]),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.cache_id, b.cache_id);
    pretty_assert_eq!(a.object_key, b.object_key);
    pretty_assert_eq!(a.mode, ReservationMode::StorageDirect);
}

#[test_log::test(tokio::test)]
async fn native_mode_needs_a_reservation_service() {
    let coordinator = ReservationCoordinator::new(NoReservations, context(TransferOptions::default()));
    let err = coordinator.reserve("k", &["/a"]).await.unwrap_err();
    pretty_assert_eq!(ErrorKind::of(&err), ErrorKind::Permanent);
}
