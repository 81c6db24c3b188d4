mod acme_client;
mod acme_server;
mod concurrency;
mod failures;
mod lifecycle;
#[cfg(feature = "integration-tests")]
mod live_providers;
mod renewal;
mod support;
