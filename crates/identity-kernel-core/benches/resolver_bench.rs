use criterion::{black_box, criterion_group, criterion_main, Criterion};
use identity_kernel_core::{
    assemble_contact, resolve_merge_plan, Cluster, ContactId, ContactRecord, IdentifyRequest,
    LinkPrecedence,
};
use time::{Duration, OffsetDateTime};

fn mk_record(
    index: usize,
    cluster: usize,
    link_precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> ContactRecord {
    let offset = i64::try_from(index).unwrap_or(i64::MAX);
    let at = OffsetDateTime::UNIX_EPOCH + Duration::seconds(offset);
    ContactRecord {
        id: ContactId::new(),
        email: Some(format!("person{cluster}+{index}@example.com")),
        phone_number: Some(format!("+1-555-{cluster:03}-{:04}", index % 10_000)),
        name: (index % 3 == 0).then(|| format!("Person {cluster}")),
        link_precedence,
        linked_id,
        version: 1,
        created_at: at,
        updated_at: at,
    }
}

fn mk_cluster(cluster: usize, size: usize, base: usize) -> Cluster {
    let primary = mk_record(base, cluster, LinkPrecedence::Primary, None);
    let secondaries = (1..size)
        .map(|offset| {
            mk_record(base + offset, cluster, LinkPrecedence::Secondary, Some(primary.id))
        })
        .collect();
    Cluster { primary, secondaries }
}

fn bench_resolver(c: &mut Criterion) {
    let single = vec![mk_cluster(0, 500, 0)];
    let many = (0..8).map(|cluster| mk_cluster(cluster, 250, cluster * 1_000)).collect::<Vec<_>>();
    let extend = IdentifyRequest {
        email: Some("person0+0@example.com".to_string()),
        phone: Some("+1-555-000-9999".to_string()),
        name: None,
    };
    let bridge = IdentifyRequest {
        email: Some("person0+0@example.com".to_string()),
        phone: Some("+1-555-007-7001".to_string()),
        name: Some("Bridge".to_string()),
    };
    let now = OffsetDateTime::UNIX_EPOCH + Duration::days(1);

    c.bench_function("resolve_extend_cluster_500_members", |b| {
        b.iter(|| {
            let plan = resolve_merge_plan(&extend, &single, now);
            if let Err(err) = plan {
                panic!("extend benchmark merge plan failed: {err}");
            }
        });
    });

    c.bench_function("resolve_merge_8_clusters_2000_members", |b| {
        b.iter(|| {
            let plan = resolve_merge_plan(&bridge, &many, now);
            if let Err(err) = plan {
                panic!("merge benchmark merge plan failed: {err}");
            }
        });
    });

    c.bench_function("assemble_contact_500_members", |b| {
        b.iter(|| {
            black_box(assemble_contact(&single[0]));
        });
    });
}

criterion_group!(benches, bench_resolver);
criterion_main!(benches);
