use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use forum_mirror::Canonicalizer;
use url::Url;

const LINKS: &[&str] = &[
    "/threads/welcome.1/",
    "/threads/welcome.1/page-2#post-20",
    "https://www.forum.test/threads/welcome.1/?utm_source=feed&page=3",
    "../members/alice.7/",
    "/login/?redirect=%2F",
    "https://elsewhere.test/threads/x.1/",
    "/forums/general.2/?order=title&direction=asc",
    "mailto:admin@forum.test",
];

fn bench_canonicalize(c: &mut Criterion) {
    let base = Url::parse("https://forum.test/").unwrap();
    let page = Url::parse("https://forum.test/threads/welcome.1/").unwrap();
    let canonicalizer = Canonicalizer::new(
        &base,
        "/",
        ["page"],
        &[r"/login".to_string(), r"/members/".to_string()],
    )
    .unwrap();

    let mut group = c.benchmark_group("canonicalize");
    group.throughput(Throughput::Elements(LINKS.len() as u64));
    group.bench_function("mixed_links", |b| {
        b.iter(|| {
            for link in LINKS {
                let _ = black_box(canonicalizer.canonicalize(black_box(link), Some(&page)));
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_canonicalize);
criterion_main!(benches);
