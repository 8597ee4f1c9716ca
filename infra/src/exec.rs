use crate::error::{BoxError, HostFailure, InfraError};
use backoff::{Error as BackoffError, backoff::Backoff};
use futures::future::join_all;
use std::{future::Future, net::IpAddr, time::Duration};
use tracing::{debug, warn};

/// Runs `f` on every host concurrently and waits for all of them.
///
/// A failing host never cancels the others. Every failure is collected into a
/// single [`InfraError::Fanout`] listing the hosts in dispatch order.
pub async fn execute<F, Fut, E>(hosts: &[IpAddr], f: F) -> Result<(), InfraError>
where
	F: Fn(IpAddr) -> Fut,
	Fut: Future<Output = Result<(), E>>,
	E: Into<BoxError>,
{
	if hosts.is_empty() {
		return Ok(());
	}
	let results = join_all(hosts.iter().map(|&host| {
		let fut = f(host);
		async move { (host, fut.await) }
	}))
	.await;
	let failures: Vec<HostFailure> = results
		.into_iter()
		.filter_map(|(host, result)| {
			result.err().map(|err| HostFailure {
				host,
				error: err.into(),
			})
		})
		.collect();
	if failures.is_empty() {
		return Ok(());
	}
	for failure in &failures {
		warn!(host = %failure.host, "Host step failed: {}", failure.error);
	}
	Err(InfraError::Fanout {
		total: hosts.len(),
		failures,
	})
}

/// Waits `step * n` after the n-th failure and gives up after `attempts` tries.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
	step: Duration,
	attempts: u32,
	failures: u32,
}

impl LinearBackoff {
	pub fn new(attempts: u32, step: Duration) -> Self {
		Self {
			step,
			attempts: attempts.max(1),
			failures: 0,
		}
	}
}

impl Backoff for LinearBackoff {
	fn reset(&mut self) {
		self.failures = 0;
	}

	fn next_backoff(&mut self) -> Option<Duration> {
		self.failures += 1;
		(self.failures < self.attempts).then(|| self.step * self.failures)
	}
}

/// Calls `f` up to `attempts` times, sleeping `step * attempt` between tries.
pub async fn retry<T, E, F, Fut>(attempts: u32, step: Duration, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: std::fmt::Display,
{
	let attempts = attempts.max(1);
	backoff::future::retry_notify(
		LinearBackoff::new(attempts, step),
		|| {
			let fut = f();
			async move { fut.await.map_err(BackoffError::transient) }
		},
		|err: E, delay: Duration| debug!("Attempt failed, retrying in {delay:?}: {err}"),
	)
	.await
}

/// Probes `host` until it answers, giving up with [`InfraError::NotReady`].
pub async fn wait_ready<F, Fut, E>(
	host: IpAddr,
	attempts: u32,
	step: Duration,
	probe: F,
) -> Result<(), InfraError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<(), E>>,
	E: Into<BoxError> + std::fmt::Display,
{
	retry(attempts, step, probe)
		.await
		.map_err(|source| InfraError::NotReady {
			host,
			attempts: attempts.max(1),
			source: source.into(),
		})
}
