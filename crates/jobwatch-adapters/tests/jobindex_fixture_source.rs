use std::path::Path;
use std::sync::Arc;

use jobwatch_adapters::{adapters_for_source, PageVerdict, SourceConfig, SourceMode};
use jobwatch_core::extract_key;
use jobwatch_storage::HttpFetcher;

fn fixture_source() -> SourceConfig {
    SourceConfig {
        source_id: "jobindex".into(),
        enabled: true,
        mode: SourceMode::Fixture,
        search_url: None,
        fixture_dir: None,
        max_pages: None,
    }
}

#[tokio::test]
async fn fixture_source_walks_every_saved_page_and_detail() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
    let adapters = adapters_for_source(&fixture_source(), http, &root).unwrap();
    assert_eq!(adapters.listing.source_id(), "jobindex");

    let mut keys = Vec::new();
    let mut page_no = 1;
    loop {
        let page = adapters.listing.fetch_page(page_no).await.unwrap();
        keys.extend(page.listings.iter().filter_map(|raw| extract_key(raw).ok()));
        if !page.has_next {
            break;
        }
        page_no += 1;
    }
    assert_eq!(page_no, 2);
    let names: Vec<_> = keys.iter().map(|k| k.as_str()).collect();
    assert_eq!(names, vec!["h1601234", "h1601240", "h1601234", "r998877"]);

    let mut verdicts = Vec::new();
    for key in &keys[..2] {
        let fetched = adapters.detail.fetch_detail(key, None).await;
        verdicts.push(PageVerdict::from_fetch(&fetched));
    }
    assert_eq!(verdicts, vec![PageVerdict::Expired, PageVerdict::Live]);
}
