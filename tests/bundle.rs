//! End-to-end tests for profile-bundle.
//!
//! Every test drives a real [`Bundler`] with an in-process segmentation
//! backend that paints an opaque ellipse on a transparent background, so
//! no model or external process is needed. Archives are read back with
//! the `zip` crate and decoded with `image`.
//!
//! A live run against the default `rembg` command is gated behind
//! `E2E_ENABLED`:
//!   E2E_ENABLED=1 cargo test --test bundle live_rembg -- --nocapture

use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use profile_bundle::{
    BundleConfig, BundleError, BundleProgressCallback, Bundler, ErrorKind, OutputVariant,
    ReclaimHook, SegmentationParams, Segmenter, SegmenterError, Stage, Upload,
};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn jpeg(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(w, h, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    buf.into_inner()
}

/// Insert an EXIF APP1 segment holding only the Orientation tag.
fn with_exif_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
    let mut app1 = b"Exif\0\0II\x2A\0\x08\0\0\0".to_vec();
    app1.extend_from_slice(&1u16.to_le_bytes());
    app1.extend_from_slice(&0x0112u16.to_le_bytes());
    app1.extend_from_slice(&3u16.to_le_bytes());
    app1.extend_from_slice(&1u32.to_le_bytes());
    app1.extend_from_slice(&u32::from(orientation).to_le_bytes());
    app1.extend_from_slice(&0u32.to_le_bytes());

    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((app1.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&app1);
    out.extend_from_slice(&jpeg[2..]);
    out
}

fn png(img: RgbaImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

/// Opaque ellipse in the middle of the frame, everything else transparent.
struct EllipseSegmenter;

impl Segmenter for EllipseSegmenter {
    fn name(&self) -> &str {
        "ellipse"
    }

    fn segment(&self, input: &[u8], _: &SegmentationParams) -> Result<Vec<u8>, SegmenterError> {
        let src = image::load_from_memory(input)
            .map_err(|e| SegmenterError::Http(e.to_string()))?
            .into_rgb8();
        let (w, h) = src.dimensions();
        let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
        let (rx, ry) = (w as f32 / 4.0, h as f32 / 3.0);
        let out = RgbaImage::from_fn(w, h, |x, y| {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            let p = src.get_pixel(x, y);
            let a = if dx * dx + dy * dy <= 1.0 { 255 } else { 0 };
            Rgba([p[0], p[1], p[2], a])
        });
        Ok(png(out))
    }
}

/// Returns a buffer too short to be an image.
struct TinySegmenter;

impl Segmenter for TinySegmenter {
    fn name(&self) -> &str {
        "tiny"
    }

    fn segment(&self, _: &[u8], _: &SegmentationParams) -> Result<Vec<u8>, SegmenterError> {
        Ok(vec![0u8; 50])
    }
}

/// Fully transparent output of the input's size.
struct EmptySegmenter;

impl Segmenter for EmptySegmenter {
    fn name(&self) -> &str {
        "empty"
    }

    fn segment(&self, input: &[u8], _: &SegmentationParams) -> Result<Vec<u8>, SegmenterError> {
        let (w, h) = image::load_from_memory(input)
            .map_err(|e| SegmenterError::Http(e.to_string()))?
            .dimensions();
        Ok(png(RgbaImage::new(w, h)))
    }
}

/// Records the dimensions it was given and how many calls overlapped.
#[derive(Default)]
struct ProbeSegmenter {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    seen: Mutex<Vec<(u32, u32)>>,
    delay: Duration,
}

impl ProbeSegmenter {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }
}

impl Segmenter for ProbeSegmenter {
    fn name(&self) -> &str {
        "probe"
    }

    fn segment(&self, input: &[u8], params: &SegmentationParams) -> Result<Vec<u8>, SegmenterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(img) = image::load_from_memory(input) {
            self.seen.lock().unwrap().push(img.dimensions());
        }
        std::thread::sleep(self.delay);
        let out = EllipseSegmenter.segment(input, params);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

fn bundler(segmenter: Arc<dyn Segmenter>) -> Bundler {
    let config = BundleConfig::builder().segmenter(segmenter).build().unwrap();
    Bundler::new(config).unwrap()
}

fn read_entry(archive: &[u8], name: &str) -> DynamicImage {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
    let mut file = zip.by_name(name).unwrap();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).unwrap();
    image::load_from_memory(&bytes).unwrap()
}

fn counting_hook() -> (ReclaimHook, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let hook: ReclaimHook = Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    (hook, count)
}

// ── Archive shape ────────────────────────────────────────────────────────────

#[tokio::test]
async fn archive_has_two_square_entries() {
    let bundler = bundler(Arc::new(EllipseSegmenter));
    let bundle = bundler
        .bundle(Upload::new(jpeg(640, 480), "image/jpeg"))
        .await
        .unwrap();

    assert_eq!(bundle.content_type(), "application/zip");
    let zip = zip::ZipArchive::new(Cursor::new(bundle.archive.as_slice())).unwrap();
    assert_eq!(zip.len(), 2);

    for (name, size) in [("profile_512.png", 512), ("profile_92.png", 92)] {
        let img = read_entry(&bundle.archive, name);
        assert_eq!(img.dimensions(), (size, size), "{name}");
        assert!(img.color().has_alpha(), "{name} lost its alpha channel");
    }
    assert!(bundle.stats.subject.is_some());
    assert_eq!(bundle.stats.archive_bytes, bundle.archive.len());
}

#[tokio::test]
async fn custom_variants_in_order() {
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EllipseSegmenter))
        .variants(vec![
            OutputVariant::new(256, 0.10),
            OutputVariant::new(128, 0.12),
            OutputVariant::new(32, 0.14),
        ])
        .build()
        .unwrap();
    let bundle = Bundler::new(config)
        .unwrap()
        .bundle(Upload::new(jpeg(300, 300), "image/jpeg"))
        .await
        .unwrap();

    let names: Vec<_> = bundle.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["profile_256.png", "profile_128.png", "profile_32.png"]);
    assert_eq!(read_entry(&bundle.archive, "profile_32.png").dimensions(), (32, 32));
}

#[tokio::test]
async fn png_and_webp_uploads_are_accepted() {
    let bundler = bundler(Arc::new(EllipseSegmenter));
    let photo = png(RgbaImage::from_pixel(200, 160, Rgba([90, 120, 200, 255])));
    let bundle = bundler.bundle(Upload::new(photo, "image/png")).await.unwrap();
    assert_eq!(bundle.entries.len(), 2);

    let mut webp = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(120, 90, Rgb([10, 200, 30])))
        .write_to(&mut webp, ImageFormat::WebP)
        .unwrap();
    let bundle = bundler
        .bundle(Upload::new(webp.into_inner(), "image/webp"))
        .await
        .unwrap();
    assert_eq!(bundle.entries.len(), 2);
}

// ── Preprocessing bounds ─────────────────────────────────────────────────────

#[tokio::test]
async fn large_photo_is_shrunk_before_segmentation() {
    let probe = ProbeSegmenter::with_delay(Duration::ZERO);
    let bundler = bundler(probe.clone());
    let bundle = bundler
        .bundle(Upload::new(jpeg(2000, 3000), "image/jpeg"))
        .await
        .unwrap();

    let seen = probe.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let (w, h) = seen[0];
    assert!(w.max(h) <= 768, "{w}x{h} exceeds max side");
    assert!(u64::from(w) * u64::from(h) <= 900_000, "{w}x{h} exceeds max pixels");
    assert_eq!(bundle.stats.source_dims, (2000, 3000));
    assert_eq!(bundle.stats.prepared_dims, (w, h));
}

#[tokio::test]
async fn small_photo_is_not_enlarged() {
    let probe = ProbeSegmenter::with_delay(Duration::ZERO);
    bundler(probe.clone())
        .bundle(Upload::new(jpeg(320, 200), "image/jpeg"))
        .await
        .unwrap();
    assert_eq!(probe.seen.lock().unwrap()[0], (320, 200));
}

#[tokio::test]
async fn segmentation_sees_the_upright_photo() {
    let probe = ProbeSegmenter::with_delay(Duration::ZERO);
    let photo = with_exif_orientation(&jpeg(400, 200), 6);
    let bundle = bundler(probe.clone())
        .bundle(Upload::new(photo, "image/jpeg"))
        .await
        .unwrap();
    assert_eq!(probe.seen.lock().unwrap()[0], (200, 400));
    assert_eq!(bundle.stats.source_dims, (200, 400));
}

#[tokio::test]
async fn precrop_hands_a_square_to_segmentation() {
    let probe = ProbeSegmenter::with_delay(Duration::ZERO);
    let config = BundleConfig::builder()
        .segmenter(probe.clone())
        .precrop_bias(Some(0.12))
        .build()
        .unwrap();
    Bundler::new(config)
        .unwrap()
        .bundle(Upload::new(jpeg(400, 700), "image/jpeg"))
        .await
        .unwrap();
    let (w, h) = probe.seen.lock().unwrap()[0];
    assert_eq!(w, h);
}

// ── Failure classification ───────────────────────────────────────────────────

#[tokio::test]
async fn unsupported_type_is_rejected_before_segmentation() {
    let probe = ProbeSegmenter::with_delay(Duration::ZERO);
    let bundler = bundler(probe.clone());
    let err = bundler
        .bundle(Upload::new(b"GIF89a".to_vec(), "image/gif"))
        .await
        .unwrap_err();

    assert!(matches!(err, BundleError::UnsupportedMediaType { .. }));
    assert_eq!(err.to_response().status, 400);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_and_oversized_uploads() {
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EllipseSegmenter))
        .max_upload_bytes(1024)
        .build()
        .unwrap();
    let bundler = Bundler::new(config).unwrap();

    let err = bundler.bundle(Upload::new(Vec::new(), "image/jpeg")).await.unwrap_err();
    assert!(matches!(err, BundleError::EmptyUpload));

    let err = bundler
        .bundle(Upload::new(vec![0u8; 2048], "image/jpeg"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 413);
}

#[tokio::test]
async fn tiny_segmentation_output_is_a_segmentation_failure() {
    let (hook, count) = counting_hook();
    let config = BundleConfig::builder()
        .segmenter(Arc::new(TinySegmenter))
        .reclaim_hook(hook)
        .build()
        .unwrap();
    let err = Bundler::new(config)
        .unwrap()
        .bundle(Upload::new(jpeg(100, 100), "image/jpeg"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Segmentation);
    assert!(matches!(
        err,
        BundleError::SegmentationOutputTooSmall { bytes: 50, .. }
    ));
    assert_eq!(count.load(Ordering::SeqCst), 1, "reclaim must run on failure");
}

#[tokio::test]
async fn undecodable_upload_is_internal_with_generic_detail() {
    let bundler = bundler(Arc::new(EllipseSegmenter));
    let err = bundler
        .bundle(Upload::new(b"not really a jpeg".to_vec(), "image/jpeg"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    let resp = err.to_response();
    assert_eq!(resp.status, 500);
    assert!(!resp.detail.contains("jpeg"), "internals leaked: {}", resp.detail);
}

#[tokio::test]
async fn slow_segmentation_times_out() {
    let config = BundleConfig::builder()
        .segmenter(ProbeSegmenter::with_delay(Duration::from_millis(300)))
        .segmentation_timeout(Some(Duration::from_millis(20)))
        .build()
        .unwrap();
    let err = Bundler::new(config)
        .unwrap()
        .bundle(Upload::new(jpeg(64, 64), "image/jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::SegmentationTimeout { .. }));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_command_frees_its_slot() {
    let hung = profile_bundle::CommandSegmenter::new(
        "sh",
        vec!["-c".into(), "cat >/dev/null; sleep 5".into()],
    );
    let config = BundleConfig::builder()
        .segmenter(Arc::new(hung))
        .admission_limit(1)
        .segmentation_timeout(Some(Duration::from_millis(200)))
        .admission_timeout(Some(Duration::from_millis(1500)))
        .build()
        .unwrap();
    let bundler = Bundler::new(config).unwrap();

    let err = bundler
        .bundle(Upload::new(jpeg(64, 64), "image/jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::SegmentationTimeout { .. }), "{err:?}");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bundler.admission().available(), 1, "killed child still holds the permit");

    // The next request is admitted and times out in segmentation, not in the queue.
    let err = bundler
        .bundle(Upload::new(jpeg(64, 64), "image/jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::SegmentationTimeout { .. }), "{err:?}");
}

// ── Postprocessing edge cases ────────────────────────────────────────────────

#[tokio::test]
async fn fully_transparent_result_skips_crop() {
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EmptySegmenter))
        .min_segmentation_bytes(1)
        .build()
        .unwrap();
    let bundle = Bundler::new(config)
        .unwrap()
        .bundle(Upload::new(jpeg(300, 200), "image/jpeg"))
        .await
        .unwrap();

    assert!(bundle.stats.subject.is_none());
    let img = read_entry(&bundle.archive, "profile_92.png").into_rgba8();
    assert_eq!(img.dimensions(), (92, 92));
    assert!(img.pixels().all(|p| p[3] == 0));
}

#[tokio::test]
async fn subject_sits_inside_the_canvas() {
    let bundler = bundler(Arc::new(EllipseSegmenter));
    let bundle = bundler
        .bundle(Upload::new(jpeg(400, 400), "image/jpeg"))
        .await
        .unwrap();
    let img = read_entry(&bundle.archive, "profile_512.png").into_rgba8();
    // Centre column is subject, corners are padding.
    assert!(img.get_pixel(256, 256)[3] > 200);
    assert_eq!(img.get_pixel(0, 0)[3], 0);
    assert_eq!(img.get_pixel(511, 511)[3], 0);
}

// ── Concurrency ──────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_bounds_concurrent_segmentation() {
    let probe = ProbeSegmenter::with_delay(Duration::from_millis(40));
    let config = BundleConfig::builder()
        .segmenter(probe.clone())
        .admission_limit(2)
        .build()
        .unwrap();
    let bundler = Arc::new(Bundler::new(config).unwrap());

    let runs = (0..6).map(|_| {
        let bundler = Arc::clone(&bundler);
        tokio::spawn(async move {
            bundler
                .bundle(Upload::new(jpeg(160, 120), "image/jpeg"))
                .await
        })
    });
    for result in futures::future::join_all(runs).await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
    assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(bundler.admission().available(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_request_times_out_waiting_for_a_slot() {
    let config = BundleConfig::builder()
        .segmenter(ProbeSegmenter::with_delay(Duration::from_millis(400)))
        .admission_limit(1)
        .admission_timeout(Some(Duration::from_millis(50)))
        .build()
        .unwrap();
    let bundler = Arc::new(Bundler::new(config).unwrap());

    let first = {
        let bundler = Arc::clone(&bundler);
        tokio::spawn(async move { bundler.bundle(Upload::new(jpeg(64, 64), "image/jpeg")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let err = bundler
        .bundle(Upload::new(jpeg(64, 64), "image/jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::AdmissionTimeout { .. }));
    assert!(first.await.unwrap().is_ok());
}

// ── Hooks and callbacks ──────────────────────────────────────────────────────

#[tokio::test]
async fn reclaim_hook_fires_once_per_run() {
    let (hook, count) = counting_hook();
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EllipseSegmenter))
        .reclaim_hook(hook)
        .build()
        .unwrap();
    let bundler = Bundler::new(config).unwrap();

    bundler.bundle(Upload::new(jpeg(80, 80), "image/jpeg")).await.unwrap();
    bundler.bundle(Upload::new(jpeg(80, 80), "image/jpeg")).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl BundleProgressCallback for Recorder {
    fn on_bundle_start(&self, _input_bytes: usize) {
        self.events.lock().unwrap().push("start".into());
    }
    fn on_stage_complete(&self, stage: Stage, _elapsed_ms: u64) {
        self.events.lock().unwrap().push(stage.to_string());
    }
    fn on_bundle_complete(&self, _archive_bytes: usize) {
        self.events.lock().unwrap().push("complete".into());
    }
    fn on_bundle_error(&self, detail: &str) {
        self.events.lock().unwrap().push(format!("error: {detail}"));
    }
}

#[tokio::test]
async fn progress_events_follow_the_pipeline() {
    let recorder = Arc::new(Recorder::default());
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EllipseSegmenter))
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let bundler = Bundler::new(config).unwrap();

    bundler.bundle(Upload::new(jpeg(80, 80), "image/jpeg")).await.unwrap();
    assert_eq!(
        *recorder.events.lock().unwrap(),
        [
            "start",
            "preprocess",
            "admission",
            "segment",
            "postprocess",
            "package",
            "complete"
        ]
    );

    recorder.events.lock().unwrap().clear();
    let _ = bundler.bundle(Upload::new(Vec::new(), "image/png")).await;
    assert_eq!(*recorder.events.lock().unwrap(), ["error: Empty file"]);
}

// ── File output ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn bundle_to_file_writes_a_complete_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out/me.zip");
    let bundler = bundler(Arc::new(EllipseSegmenter));

    let stats = bundler
        .bundle_to_file(Upload::new(jpeg(120, 90), "image/jpeg"), &path)
        .await
        .unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), stats.archive_bytes);
    assert_eq!(read_entry(&bytes, "profile_512.png").dimensions(), (512, 512));
    // Only the archive itself remains; no temp files.
    assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
}

#[tokio::test]
async fn failed_run_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("me.zip");
    let bundler = bundler(Arc::new(TinySegmenter));

    assert!(bundler
        .bundle_to_file(Upload::new(jpeg(64, 64), "image/jpeg"), &path)
        .await
        .is_err());
    assert!(!path.exists());
}

#[test]
fn bundle_sync_runs_without_an_outer_runtime() {
    let config = BundleConfig::builder()
        .segmenter(Arc::new(EllipseSegmenter))
        .build()
        .unwrap();
    let bundle =
        profile_bundle::bundle_sync(Upload::new(jpeg(50, 50), "image/jpeg"), &config).unwrap();
    assert_eq!(bundle.entries.len(), 2);
}

// ── Live backend ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn live_rembg() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 to run against the real segmentation backend");
        return;
    }
    let bundler = Bundler::new(BundleConfig::default()).unwrap();
    let bundle = bundler
        .bundle(Upload::new(jpeg(640, 480), "image/jpeg"))
        .await
        .unwrap();
    println!("{:#?}", bundle.stats);
    assert_eq!(bundle.entries.len(), 2);
}
