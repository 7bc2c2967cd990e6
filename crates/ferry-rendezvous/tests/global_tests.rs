//! Process-wide service initialization
//!
//! Lives in its own test binary: the global instance can be set only once
//! per process.

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use ferry_rendezvous::{
    Channel, ChannelState, FerryConfig, FerryError, RendezvousService, StaticAddressEcho,
};
use serial_test::serial;
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn test_init_global_once() {
    assert!(RendezvousService::global().is_none());

    let echo = Arc::new(StaticAddressEcho("198.51.100.20".to_string()));
    let service = RendezvousService::init_global(FerryConfig::testing(), echo.clone())
        .await
        .unwrap();

    let global = RendezvousService::global().unwrap();
    assert!(Arc::ptr_eq(&service, &global));

    assert_matches!(
        RendezvousService::init_global(FerryConfig::testing(), echo).await,
        Err(FerryError::AlreadyInitialized)
    );

    let channel = Channel::new(global);
    let synq = channel.request().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Initiated);
    assert!(synq.supported.iter().any(|name| name == "Provider"));
}
