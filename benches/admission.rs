use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tower::{Service, ServiceBuilder};
use trackgate::admission::{AdmissionLayer, AdmissionRequest, AuthAttempt, AuthOutcome};
use trackgate::{
    AdmissionConfig, AdmissionGate, ClientIdentity, EndpointClass, ManualClock, RateLimitConfig,
    RateLimitRegistry, RateLimitTable,
};

// A request from a fixed peer to the tracking endpoint.
#[derive(Clone, Copy)]
struct Ping(IpAddr);

impl AdmissionRequest for Ping {
    fn client_identity(&self) -> Option<ClientIdentity> {
        Some(ClientIdentity::from_addr(self.0))
    }

    fn endpoint_class(&self) -> EndpointClass {
        EndpointClass::Tracking
    }
}

struct Pong;

impl AuthAttempt for Pong {
    fn auth_outcome(&self) -> Option<AuthOutcome> {
        None
    }
}

#[derive(Clone)]
struct PongService;

impl Service<Ping> for PongService {
    type Response = Pong;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Ping) -> Self::Future {
        futures::future::ready(Ok(Pong))
    }
}

fn clients(n: u32) -> Vec<ClientIdentity> {
    (0..n).map(|i| ClientIdentity::from_addr(IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)))).collect()
}

fn registry_hot_key(c: &mut Criterion) {
    // Frozen clock: after the burst every check is a rejection on one shard.
    let registry = RateLimitRegistry::new(RateLimitTable::default()).with_clock(ManualClock::new());
    let client = ClientIdentity::from_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));

    c.bench_function("registry_check_hot_key", |b| {
        b.iter(|| black_box(registry.check(black_box(&client), EndpointClass::Tracking)));
    });
}

fn registry_spread_keys(c: &mut Criterion) {
    let mut table = RateLimitTable::default();
    table.set(EndpointClass::Tracking, RateLimitConfig::new(u32::MAX, u32::MAX));
    let registry = RateLimitRegistry::new(table);
    let keys = clients(10_000);
    let mut i = 0usize;

    c.bench_function("registry_check_10k_clients", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(registry.check(&keys[i], EndpointClass::Tracking))
        });
    });
}

fn layer_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = AdmissionConfig::default()
        .with_rate_limit(EndpointClass::Tracking, RateLimitConfig::new(u32::MAX, u32::MAX));
    let gate = Arc::new(AdmissionGate::new(config, b"bench-secret-0123456789abcdefghij").unwrap());
    let svc = ServiceBuilder::new().layer(AdmissionLayer::new(gate)).service(PongService);

    c.bench_function("admission_layer_admitted", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let ping = black_box(Ping(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            let _ = black_box(local_svc.call(ping)).await;
        });
    });
}

criterion_group!(benches, registry_hot_key, registry_spread_keys, layer_throughput);
criterion_main!(benches);
