//! Benchmarks for restriction tightening and token handling.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mytoken::crypto::{open_str, seal_str};
use mytoken::{tighten, Capabilities, Mytoken, NewMytoken, Restriction, Restrictions, SigningKey};

const NOW: i64 = 1_700_000_000;

fn restriction(i: i64) -> Restriction {
    Restriction {
        not_before: NOW,
        expires_at: NOW + 3600 * (i + 1),
        scope: "openid profile storage.read storage.write".into(),
        audiences: vec!["https://a.example".into(), "https://b.example".into()],
        hosts: vec!["10.0.0.0/8".into(), "*.example.org".into()],
        geoip_allow: vec!["DE".into(), "FR".into()],
        usages_at: Some(100),
        usages_other: Some(10),
        ..Default::default()
    }
}

fn narrower(i: i64) -> Restriction {
    Restriction {
        expires_at: NOW + 1800 * (i + 1),
        scope: "openid storage.read".into(),
        audiences: vec!["https://a.example".into()],
        hosts: vec!["10.1.0.0/16".into()],
        geoip_allow: vec!["DE".into()],
        usages_at: Some(10),
        usages_other: Some(1),
        ..restriction(i)
    }
}

fn benchmark_tightening(c: &mut Criterion) {
    let single: Restrictions = vec![restriction(0)].into();
    let wanted: Restrictions = vec![narrower(0)].into();
    c.bench_function("tighten_single", |b| {
        b.iter(|| tighten(black_box(&single), black_box(&wanted)))
    });

    let many: Restrictions = (0..16).map(restriction).collect::<Vec<_>>().into();
    let wanted_many: Restrictions = (0..16).rev().map(narrower).collect::<Vec<_>>().into();
    c.bench_function("tighten_16x16", |b| {
        b.iter(|| tighten(black_box(&many), black_box(&wanted_many)))
    });

    let r = restriction(0);
    let n = narrower(0);
    c.bench_function("restriction_is_tighter_than", |b| {
        b.iter(|| black_box(&n).is_tighter_than(black_box(&r)))
    });
    c.bench_function("restriction_hash", |b| b.iter(|| black_box(&r).hash().unwrap()));
}

fn benchmark_tokens(c: &mut Criterion) {
    let key = SigningKey::generate();
    let public = key.public_key();
    let issuer = "https://mytoken.example";
    let mt = Mytoken::new(
        NewMytoken {
            oidc_sub: "alice".into(),
            oidc_iss: "https://op.example".into(),
            name: Some("bench".into()),
            restrictions: vec![restriction(0)].into(),
            capabilities: Capabilities::defaults(),
            subtoken_capabilities: None,
            rotation: None,
        },
        issuer,
        NOW,
    );
    let jwt = mt.to_jwt(&key).unwrap();

    c.bench_function("mytoken_sign", |b| b.iter(|| black_box(&mt).to_jwt(&key).unwrap()));
    c.bench_function("mytoken_verify", |b| {
        b.iter(|| Mytoken::parse(black_box(&jwt), &public, issuer, NOW).unwrap())
    });

    let sealed = seal_str("refresh-token-value", &jwt).unwrap();
    c.bench_function("refresh_token_open", |b| {
        b.iter(|| open_str(black_box(&sealed), &jwt).unwrap())
    });
}

criterion_group!(benches, benchmark_tightening, benchmark_tokens);
criterion_main!(benches);
