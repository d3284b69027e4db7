use anyhow::Result;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use realty_import::config::Config;
use realty_import::domain::BatchStatus;
use realty_import::error::ErrorKind;
use realty_import::observability::MemoryActivityLog;
use realty_import::pipeline::photos::{InMemoryBlobStore, PhotoFetcher, PhotoJob, PhotoRenderer, PhotoWorkerPool};
use realty_import::pipeline::{normalize, parse_feed, ImportOrchestrator, ImportRequest};
use realty_import::storage::{InMemoryStorage, Storage};

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([30, 120, 200])));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).expect("encode png");
    out.into_inner()
}

fn feed_with_photos(urls: &[String]) -> Vec<u8> {
    let fotos: String = urls
        .iter()
        .map(|u| format!("<Foto><URLArquivo>{}</URLArquivo></Foto>", u))
        .collect();
    format!(
        r#"<Carga><Imoveis><Imovel>
            <CodigoImovel>501</CodigoImovel>
            <Referencia>CA501</Referencia>
            <TipoImovel>Casa</TipoImovel>
            <Endereco>Rua das Flores</Endereco>
            <Numero>12</Numero>
            <Bairro>Jardim</Bairro>
            <Cidade>Campinas</Cidade>
            <AreaTotal>250</AreaTotal>
            <Venda>1</Venda>
            <PrecoVenda>900000</PrecoVenda>
            <Fotos>{}</Fotos>
        </Imovel></Imoveis></Carga>"#,
        fotos
    )
    .into_bytes()
}

async fn photo_server(broken: &[usize], count: usize) -> (MockServer, Vec<String>) {
    let server = MockServer::start().await;
    let mut urls = Vec::new();
    for i in 0..count {
        let route = format!("/photos/{}.png", i);
        let response = if broken.contains(&i) {
            ResponseTemplate::new(500)
        } else {
            ResponseTemplate::new(200).set_body_raw(png(1200, 900), "image/png")
        };
        Mock::given(method("GET")).and(path(route.as_str())).respond_with(response).mount(&server).await;
        urls.push(format!("{}{}", server.uri(), route));
    }
    (server, urls)
}

/// Every photo answers, but only after `delay`
async fn slow_photo_server(count: usize, delay: Duration) -> (MockServer, Vec<String>) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(png(640, 480), "image/png")
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    let urls = (0..count).map(|i| format!("{}/photos/{}.png", server.uri(), i)).collect();
    (server, urls)
}

fn request(tenant_id: Uuid, feed: Vec<u8>) -> ImportRequest {
    ImportRequest {
        tenant_id,
        source: "vista".to_string(),
        created_by: Some(Uuid::new_v4()),
        feed,
        enrichment: None,
    }
}

#[tokio::test]
async fn test_one_broken_photo_does_not_affect_the_others() -> Result<()> {
    let (_server, urls) = photo_server(&[2], 5).await;
    let storage = Arc::new(InMemoryStorage::new());
    let blobs = InMemoryBlobStore::new();
    let activity = MemoryActivityLog::new();
    let orchestrator = ImportOrchestrator::from_config(
        &Config::default(),
        storage.clone(),
        Arc::new(blobs.clone()),
        Arc::new(activity.clone()),
    )?;
    let tenant = Uuid::new_v4();

    let summary = orchestrator.run(&request(tenant, feed_with_photos(&urls))).await?;
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.counters.properties_created, 1);
    assert_eq!(summary.counters.photos_rendered, 4);
    assert_eq!(summary.counters.photos_failed, 1);
    assert_eq!(summary.photo_jobs_pending, 0);

    // Photo problems are audited but are not record failures
    assert_eq!(summary.counters.errors, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, ErrorKind::PhotoDownloadFailed);
    assert_eq!(summary.errors[0].raw_data["order"], 2);

    let property = &storage.all_properties(tenant)[0];
    let property_id = property.id.expect("property id");
    let listings = storage.listings_for_property(property_id).await?;
    assert_eq!(listings.len(), 1);
    let photos = &listings[0].photos;
    assert_eq!(photos.len(), 5);
    for (i, photo) in photos.iter().enumerate() {
        assert_eq!(photo.order as usize, i);
        assert_eq!(photo.original_url, urls[i]);
        assert_eq!(photo.is_rendered(), i != 2);
    }
    assert!(photos[0].is_cover);
    assert!(photos[0].thumb_url.starts_with("memory://tenants/"));

    // three renditions for each of the four good photos
    assert_eq!(blobs.keys().len(), 12);
    let thumb_key = format!("tenants/{}/properties/{}/photos/0/thumb.jpg", tenant, property_id);
    let thumb = image::load_from_memory(&blobs.get(&thumb_key).expect("thumb stored"))?;
    assert_eq!((thumb.width(), thumb.height()), (320, 240));

    assert_eq!(activity.named("photos_processed").len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_photo_is_a_decode_failure() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/photos/garbage.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"definitely not a jpeg".to_vec(), "image/jpeg"))
        .mount(&server)
        .await;
    let storage = Arc::new(InMemoryStorage::new());
    let orchestrator = ImportOrchestrator::from_config(
        &Config::default(),
        storage.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(MemoryActivityLog::new()),
    )?;

    let urls = vec![format!("{}/photos/garbage.jpg", server.uri())];
    let summary = orchestrator.run(&request(Uuid::new_v4(), feed_with_photos(&urls))).await?;

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.counters.photos_rendered, 0);
    assert_eq!(summary.counters.photos_failed, 1);
    assert_eq!(summary.errors[0].kind, ErrorKind::PhotoDecodeFailed);
    Ok(())
}

#[tokio::test]
async fn test_disabled_photos_keep_source_urls() -> Result<()> {
    let mut config = Config::default();
    config.photos.enabled = false;
    let storage = Arc::new(InMemoryStorage::new());
    let blobs = InMemoryBlobStore::new();
    let orchestrator = ImportOrchestrator::from_config(
        &config,
        storage.clone(),
        Arc::new(blobs.clone()),
        Arc::new(MemoryActivityLog::new()),
    )?;
    let tenant = Uuid::new_v4();
    let urls = vec!["http://cdn.example.com/a.jpg".to_string()];

    let summary = orchestrator.run(&request(tenant, feed_with_photos(&urls))).await?;
    assert_eq!(summary.counters.photos_rendered, 0);
    assert!(blobs.keys().is_empty());

    let property_id = storage.all_properties(tenant)[0].id.expect("property id");
    let listing = &storage.listings_for_property(property_id).await?[0];
    assert_eq!(listing.photos.len(), 1);
    assert!(!listing.photos[0].is_rendered());
    assert_eq!(listing.photos[0].large_url, "http://cdn.example.com/a.jpg");
    Ok(())
}

#[tokio::test]
async fn test_unawaited_photo_jobs_are_reported_pending() -> Result<()> {
    let (_server, urls) = slow_photo_server(2, Duration::from_secs(3)).await;
    let mut config = Config::default();
    config.photos.await_before_complete = false;
    let storage = Arc::new(InMemoryStorage::new());
    let orchestrator = ImportOrchestrator::from_config(
        &config,
        storage.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(MemoryActivityLog::new()),
    )?;
    let tenant = Uuid::new_v4();

    let summary = orchestrator.run(&request(tenant, feed_with_photos(&urls))).await?;
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.counters.properties_created, 1);
    assert_eq!(summary.photo_jobs_pending, 1);
    assert_eq!(summary.counters.photos_rendered, 0);
    assert_eq!(summary.counters.photos_failed, 0);

    // the listing still points at the source photos
    let property_id = storage.all_properties(tenant)[0].id.expect("property id");
    let listing = &storage.listings_for_property(property_id).await?[0];
    assert!(listing.photos.iter().all(|p| !p.is_rendered()));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_pool_reports_jobs_as_cancelled() -> Result<()> {
    let (_server, urls) = slow_photo_server(1, Duration::from_secs(5)).await;
    let config = Config::default();
    let blobs = InMemoryBlobStore::new();
    let renderer = PhotoRenderer::new(PhotoFetcher::new(&config.photos)?, Arc::new(blobs.clone()), 4, 85);
    let token = CancellationToken::new();
    let pool = PhotoWorkerPool::new(Arc::new(renderer), Arc::new(InMemoryStorage::new()), 1, token.clone());

    let batch_id = Uuid::new_v4();
    let listings = [Uuid::new_v4(), Uuid::new_v4()];
    for listing_id in listings {
        pool.submit(PhotoJob {
            batch_id,
            tenant_id: Uuid::new_v4(),
            property_id: Uuid::new_v4(),
            listing_id,
            urls: urls.clone(),
        });
    }
    assert_eq!(pool.pending(), 2);

    token.cancel();
    let reports = tokio::time::timeout(Duration::from_secs(2), pool.drain()).await?;

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert!(report.cancelled);
        assert_eq!(report.rendered, 0);
        assert!(!report.listing_updated);
        assert!(listings.contains(&report.listing_id));
    }
    assert_eq!(pool.pending(), 0);
    assert!(blobs.keys().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_drain_only_counts_the_sealing_batch() -> Result<()> {
    let (_server, urls) = photo_server(&[], 2).await;
    let storage = Arc::new(InMemoryStorage::new());
    let activity = MemoryActivityLog::new();
    let orchestrator = ImportOrchestrator::from_config(
        &Config::default(),
        storage.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(activity.clone()),
    )?;
    let tenant = Uuid::new_v4();

    // batch one hands a photo job to the pool and is never sealed here
    let mut first = orchestrator.create_batch(tenant, "vista", None).await?;
    let record = parse_feed(&feed_with_photos(&urls))?.remove(0);
    orchestrator
        .import_record(&mut first, normalize(&record, None, tenant, "vista"))
        .await?;

    let mut second = orchestrator.create_batch(tenant, "vista", None).await?;
    orchestrator.complete_batch(&mut second).await?;

    assert_eq!(second.status, BatchStatus::Completed);
    assert_eq!(second.counters.photos_rendered, 0);
    assert_eq!(second.counters.photos_failed, 0);
    assert_eq!(first.counters.photos_rendered, 0);
    assert!(activity.named("photos_processed").is_empty());

    // the job itself still ran and updated batch one's listing
    let property_id = storage.all_properties(tenant)[0].id.expect("property id");
    let listing = &storage.listings_for_property(property_id).await?[0];
    assert_eq!(listing.import_batch_id, Some(first.id));
    assert!(listing.photos.iter().all(|p| p.is_rendered()));
    Ok(())
}
