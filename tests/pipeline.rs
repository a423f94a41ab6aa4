use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use comic_translator_rust::adapters::{
    AdapterFuture, TranslationItem, TranslationOutcome, TranslationRequest,
};
use comic_translator_rust::pipeline::{ReorderMethod, ReorderRecord, identity_order};
use comic_translator_rust::records::{
    BBox, BubbleType, DetectionOutput, ExtractedText, ImageSize, ReorderedText, TextBox,
    TextDirection, TranslatedText,
};
use comic_translator_rust::{
    Adapters, Pipeline, PipelineConfig, ProcessOptions, Renderer, Stage, StageCache, StageError,
    StageResult, TerminologyStore, TextDetector, TextExtractor, TextReorderer, TextTranslator,
};

#[derive(Clone, Default)]
struct Calls {
    detect: Arc<AtomicUsize>,
    extract: Arc<AtomicUsize>,
    reorder_image: Arc<AtomicUsize>,
    reorder_text: Arc<AtomicUsize>,
    translate: Arc<AtomicUsize>,
    render: Arc<AtomicUsize>,
    history_sizes: Arc<Mutex<Vec<usize>>>,
}

fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

fn stem(image: &Path) -> String {
    image
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Two boxes per page unless overridden; even indices are vertical.
struct StubDetector {
    calls: Calls,
    boxes: HashMap<String, usize>,
}

impl TextDetector for StubDetector {
    fn detect<'a>(&'a self, image: &'a Path) -> AdapterFuture<'a, DetectionOutput> {
        Box::pin(async move {
            self.calls.detect.fetch_add(1, Ordering::SeqCst);
            let total = self.boxes.get(&stem(image)).copied().unwrap_or(2);
            let boxes = (0..total)
                .map(|index| TextBox {
                    index,
                    bbox: BBox::new(index as u32 * 10, 0, 10, 10),
                    xyxy: None,
                    angle: 0.0,
                    vertical: index % 2 == 0,
                    font_size: None,
                    polylines: Vec::new(),
                })
                .collect();
            Ok(DetectionOutput {
                boxes,
                image_size: ImageSize {
                    width: 100,
                    height: 100,
                },
            })
        })
    }
}

struct StubExtractor {
    calls: Calls,
}

impl TextExtractor for StubExtractor {
    fn extract<'a>(
        &'a self,
        image: &'a Path,
        boxes: &'a [TextBox],
    ) -> AdapterFuture<'a, Vec<ExtractedText>> {
        Box::pin(async move {
            self.calls.extract.fetch_add(1, Ordering::SeqCst);
            Ok(boxes
                .iter()
                .map(|text_box| ExtractedText {
                    box_index: text_box.index,
                    bbox: text_box.bbox,
                    rendered_bbox: text_box.bbox,
                    text: format!("{}#{}", stem(image), text_box.index),
                    angle: text_box.angle,
                    vertical: text_box.vertical,
                    was_rotated: false,
                })
                .collect())
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum ReorderMode {
    Reverse,
    ImageFails,
    AllFail,
}

struct StubReorderer {
    calls: Calls,
    mode: ReorderMode,
}

fn reversed(texts: &[ExtractedText]) -> Vec<ReorderedText> {
    texts
        .iter()
        .rev()
        .enumerate()
        .map(|(position, text)| ReorderedText {
            original_index: text.box_index,
            new_order: position,
            bbox: text.bbox,
            text: text.text.clone(),
        })
        .collect()
}

impl TextReorderer for StubReorderer {
    fn reorder_with_image<'a>(
        &'a self,
        _image: &'a Path,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>> {
        Box::pin(async move {
            self.calls.reorder_image.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                ReorderMode::Reverse => Ok(reversed(texts)),
                _ => Err(StageError::Rejected("blocked".to_string())),
            }
        })
    }

    fn reorder_text_only<'a>(
        &'a self,
        texts: &'a [ExtractedText],
    ) -> AdapterFuture<'a, Vec<ReorderedText>> {
        Box::pin(async move {
            self.calls.reorder_text.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                ReorderMode::AllFail => {
                    Err(StageError::MalformedResponse("missing reordered_texts".to_string()))
                }
                _ => Ok(reversed(texts)),
            }
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum TranslateMode {
    Echo,
    DropLast,
    Fail,
}

struct StubTranslator {
    calls: Calls,
    mode: TranslateMode,
    /// Popped once per call; empty maps afterwards.
    terms: Mutex<VecDeque<BTreeMap<String, String>>>,
}

impl TextTranslator for StubTranslator {
    fn translate<'a>(
        &'a self,
        request: TranslationRequest<'a>,
    ) -> AdapterFuture<'a, TranslationOutcome> {
        Box::pin(async move {
            self.calls.translate.fetch_add(1, Ordering::SeqCst);
            self.calls
                .history_sizes
                .lock()
                .expect("history lock")
                .push(request.history.len());
            if self.mode == TranslateMode::Fail {
                return Ok(TranslationOutcome::pass_through(
                    request.texts,
                    "all strategies failed".to_string(),
                ));
            }
            let mut translations = request
                .texts
                .iter()
                .map(|text| TranslationItem {
                    original: text.clone(),
                    translated: format!("译{}", text),
                    text_direction: Some(TextDirection::Horizontal),
                    bubble_type: BubbleType::PureWhite,
                    estimated_font_size: 18,
                })
                .collect::<Vec<_>>();
            if self.mode == TranslateMode::DropLast {
                translations.pop();
            }
            let new_terminology = self
                .terms
                .lock()
                .expect("terms lock")
                .pop_front()
                .unwrap_or_default();
            Ok(TranslationOutcome {
                translations,
                new_terminology,
                success: true,
                error: None,
                used_image: request.image.is_some(),
            })
        })
    }
}

struct StubRenderer {
    calls: Calls,
    fail: bool,
}

impl Renderer for StubRenderer {
    fn render(
        &self,
        _image: &Path,
        _records: &[TranslatedText],
        output: &Path,
    ) -> StageResult<PathBuf> {
        self.calls.render.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(StageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "output folder is read-only",
            )));
        }
        Ok(output.to_path_buf())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    calls: Calls,
    pipeline: Pipeline,
}

struct HarnessOptions {
    reorder: ReorderMode,
    translate: TranslateMode,
    boxes: HashMap<String, usize>,
    terms: Vec<BTreeMap<String, String>>,
    fail_render: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            reorder: ReorderMode::Reverse,
            translate: TranslateMode::Echo,
            boxes: HashMap::new(),
            terms: Vec::new(),
            fail_render: false,
        }
    }
}

impl Harness {
    fn new(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        let calls = Calls::default();
        let adapters = Adapters {
            detector: Box::new(StubDetector {
                calls: calls.clone(),
                boxes: options.boxes,
            }),
            extractor: Box::new(StubExtractor {
                calls: calls.clone(),
            }),
            reorderer: Box::new(StubReorderer {
                calls: calls.clone(),
                mode: options.reorder,
            }),
            translator: Box::new(StubTranslator {
                calls: calls.clone(),
                mode: options.translate,
                terms: Mutex::new(options.terms.into_iter().collect()),
            }),
            renderer: Box::new(StubRenderer {
                calls: calls.clone(),
                fail: options.fail_render,
            }),
        };
        let cache = StageCache::new(root.join("results")).expect("cache");
        let terminology = TerminologyStore::new(root.join("terminology_dict.json"));
        let pipeline = Pipeline::new(
            adapters,
            cache,
            terminology,
            PipelineConfig::default(),
            "stub:model",
        );
        Self {
            _dir: dir,
            root,
            calls,
            pipeline,
        }
    }

    fn page(&self, folder: &str, name: &str) -> PathBuf {
        let dir = self.root.join(folder);
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join(name);
        std::fs::write(&path, b"page").expect("write page");
        path
    }

    fn cached(&self, stage: Stage, name: &str) -> bool {
        self.pipeline.cache().exists(stage, name)
    }
}

#[tokio::test]
async fn rerun_reuses_every_cached_stage() {
    let mut harness = Harness::new(HarnessOptions::default());
    let page = harness.page("in", "page.png");

    let first = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(first.success, "{:?}", first.error);
    for stage in [Stage::Detection, Stage::Ocr, Stage::Reorder, Stage::Translate] {
        assert!(harness.cached(stage, "page.png"));
    }
    assert!(!harness.cached(Stage::Update, "page.png"));

    let second = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(second.success);
    assert_eq!(second.translated_texts, first.translated_texts);
    assert_eq!(count(&harness.calls.detect), 1);
    assert_eq!(count(&harness.calls.extract), 1);
    assert_eq!(count(&harness.calls.reorder_image), 1);
    assert_eq!(count(&harness.calls.translate), 1);
    assert_eq!(count(&harness.calls.render), 0);

    let progress = harness.pipeline.get_progress("page.png");
    assert_eq!(progress.completed_stages, 4);
    assert_eq!(progress.total_stages, 5);
    assert_eq!(progress.stage_details.get("stage4_translate"), Some(&true));

    let forced = harness
        .pipeline
        .process_image(&page, None, ProcessOptions { force: true })
        .await;
    assert!(forced.success);
    assert_eq!(count(&harness.calls.detect), 2);
    assert_eq!(count(&harness.calls.translate), 2);
}

#[tokio::test]
async fn count_mismatch_fails_image_and_skips_translation_cache() {
    let mut harness = Harness::new(HarnessOptions {
        translate: TranslateMode::DropLast,
        ..HarnessOptions::default()
    });
    let page = harness.page("in", "page.png");
    let output = harness.root.join("out/page.png");

    let report = harness
        .pipeline
        .process_image(&page, Some(&output), ProcessOptions::default())
        .await;
    assert!(!report.success);
    let error = report.error.expect("error message");
    assert!(error.contains("count mismatch"), "{}", error);
    assert_eq!(report.reordered_count, 2);
    assert!(harness.cached(Stage::Reorder, "page.png"));
    assert!(!harness.cached(Stage::Translate, "page.png"));
    assert_eq!(count(&harness.calls.render), 0);
}

#[tokio::test]
async fn exhausted_translator_fails_image() {
    let mut harness = Harness::new(HarnessOptions {
        translate: TranslateMode::Fail,
        ..HarnessOptions::default()
    });
    let page = harness.page("in", "page.png");

    let report = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(!report.success);
    assert!(
        report
            .error
            .as_deref()
            .is_some_and(|error| error.contains("all strategies failed"))
    );
    assert!(!harness.cached(Stage::Translate, "page.png"));
    assert!(harness.pipeline.history().is_empty());
}

#[tokio::test]
async fn reorder_falls_back_to_text_only() {
    let mut harness = Harness::new(HarnessOptions {
        reorder: ReorderMode::ImageFails,
        ..HarnessOptions::default()
    });
    let page = harness.page("in", "page.png");

    let report = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(report.success);
    assert_eq!(report.reorder_method, Some(ReorderMethod::FallbackTextOnly));
    assert_eq!(count(&harness.calls.reorder_image), 1);
    assert_eq!(count(&harness.calls.reorder_text), 1);
    let order = report
        .translated_texts
        .iter()
        .map(|text| text.original_index)
        .collect::<Vec<_>>();
    assert_eq!(order, vec![1, 0]);
}

#[tokio::test]
async fn reorder_failure_keeps_detection_order() {
    let mut harness = Harness::new(HarnessOptions {
        reorder: ReorderMode::AllFail,
        ..HarnessOptions::default()
    });
    let page = harness.page("in", "page.png");

    let report = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(report.success, "{:?}", report.error);
    assert_eq!(report.reorder_method, Some(ReorderMethod::IdentityOrder));

    let record = harness
        .pipeline
        .cache()
        .load::<ReorderRecord>(Stage::Reorder, "page.png")
        .expect("stage 3 cached");
    insta::assert_json_snapshot!(record, @r#"
    {
      "total_texts": 2,
      "reordered_count": 2,
      "reordered_texts": [
        {
          "original_index": 0,
          "new_order": 0,
          "bbox": [
            0,
            0,
            10,
            10
          ],
          "text": "page#0"
        },
        {
          "original_index": 1,
          "new_order": 1,
          "bbox": [
            10,
            0,
            10,
            10
          ],
          "text": "page#1"
        }
      ],
      "success": true,
      "method": "identity_order"
    }
    "#);
}

#[test]
fn identity_order_handles_empty_and_single_inputs() {
    assert!(identity_order(&[]).is_empty());
    let single = ExtractedText {
        box_index: 7,
        bbox: BBox::new(1, 2, 3, 4),
        rendered_bbox: BBox::new(1, 2, 3, 4),
        text: "ひとつ".to_string(),
        angle: 0.0,
        vertical: true,
        was_rotated: false,
    };
    let ordered = identity_order(std::slice::from_ref(&single));
    assert_eq!(ordered.len(), 1);
    assert_eq!(ordered[0].original_index, 7);
    assert_eq!(ordered[0].new_order, 0);
    assert_eq!(ordered[0].text, "ひとつ");
}

#[tokio::test]
async fn vertical_flag_comes_from_ocr_stage() {
    let mut harness = Harness::new(HarnessOptions {
        boxes: HashMap::from([("page".to_string(), 3)]),
        ..HarnessOptions::default()
    });
    let page = harness.page("in", "page.png");

    let report = harness
        .pipeline
        .process_image(&page, None, ProcessOptions::default())
        .await;
    assert!(report.success);
    let directions = report
        .translated_texts
        .iter()
        .map(|text| (text.original_index, text.text_direction))
        .collect::<Vec<_>>();
    assert_eq!(
        directions,
        vec![
            (2, TextDirection::Vertical),
            (1, TextDirection::Horizontal),
            (0, TextDirection::Vertical),
        ]
    );
    let new_orders = report
        .translated_texts
        .iter()
        .map(|text| text.new_order)
        .collect::<Vec<_>>();
    assert_eq!(new_orders, vec![0, 1, 2]);
}

#[tokio::test]
async fn batch_isolates_failed_pages() {
    let mut harness = Harness::new(HarnessOptions {
        boxes: HashMap::from([("002".to_string(), 0)]),
        ..HarnessOptions::default()
    });
    for name in ["003.png", "001.png", "002.png"] {
        harness.page("chapter", name);
    }
    harness.page("chapter", "notes.txt");
    let input = harness.root.join("chapter");

    let report = harness
        .pipeline
        .process_folder(&input, None)
        .await
        .expect("batch");
    assert_eq!(report.total_images, 3);
    assert_eq!(report.processed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.all_succeeded());
    assert!(report.failed[0].input_file.ends_with("002.png"));
    assert!(report.failed[0].error.contains("detection"));
    assert_eq!(report.output_folder, harness.root.join("chapter_translated"));
    assert!(report.output_folder.is_dir());
    assert!(report.processed[0].output_file.ends_with("translated_001.png"));
    assert!(report.processed[1].input_file.ends_with("003.png"));
    let names = report
        .timings
        .iter()
        .map(|timing| timing.file_name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["001.png", "002.png", "003.png"]);
    assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.translation_history.len(), 4);
    assert_eq!(count(&harness.calls.render), 2);

    // The second page saw the first page's translations as history.
    let sizes = harness.calls.history_sizes.lock().expect("lock").clone();
    assert_eq!(sizes, vec![0, 2]);
}

#[tokio::test]
async fn render_failure_keeps_page_translated() {
    let mut harness = Harness::new(HarnessOptions {
        fail_render: true,
        ..HarnessOptions::default()
    });
    for name in ["001.png", "002.png"] {
        harness.page("chapter", name);
    }
    let input = harness.root.join("chapter");

    let report = harness
        .pipeline
        .process_folder(&input, None)
        .await
        .expect("batch");
    assert_eq!(report.processed.len(), 2);
    assert!(report.failed.is_empty());
    assert!(!report.all_succeeded());
    assert_eq!(count(&harness.calls.render), 2);
    for page in &report.processed {
        assert!(page.report.success);
        assert!(!page.report.is_complete());
        assert!(page.report.error.is_none());
        assert!(page.report.output_path.is_none());
        let message = page.report.render_error.as_deref().expect("render error");
        assert!(message.contains("read-only"), "{}", message);
        assert_eq!(page.report.translated_texts.len(), 2);
    }
    assert!(harness.cached(Stage::Translate, "001.png"));
    assert!(harness.cached(Stage::Translate, "002.png"));
    assert_eq!(report.translation_history.len(), 4);
    let sizes = harness.calls.history_sizes.lock().expect("lock").clone();
    assert_eq!(sizes, vec![0, 2]);
}

#[tokio::test]
async fn history_keeps_latest_hundred_entries() {
    let mut harness = Harness::new(HarnessOptions {
        boxes: (0..150)
            .map(|index| (format!("page{:03}", index), 1))
            .collect(),
        ..HarnessOptions::default()
    });
    for index in 0..150 {
        harness.page("long", &format!("page{:03}.png", index));
    }
    let input = harness.root.join("long");

    let report = harness
        .pipeline
        .process_folder(&input, Some(&harness.root.join("out")))
        .await
        .expect("batch");
    assert_eq!(report.processed.len(), 150);
    assert_eq!(report.translation_history.len(), 100);
    assert_eq!(report.translation_history[0].original, "page050#0");
    assert_eq!(report.translation_history[99].original, "page149#0");

    let sizes = harness.calls.history_sizes.lock().expect("lock").clone();
    assert_eq!(sizes.first(), Some(&0));
    assert_eq!(sizes.iter().max(), Some(&10));
}

#[tokio::test]
async fn clearing_one_image_leaves_others() {
    let mut harness = Harness::new(HarnessOptions::default());
    for name in ["ch1_stage_final.png", "other.png"] {
        let page = harness.page("in", name);
        let report = harness
            .pipeline
            .process_image(&page, None, ProcessOptions::default())
            .await;
        assert!(report.success);
    }

    assert_eq!(harness.pipeline.clear_cache(Some("ch1_stage_final.png")), 4);
    assert!(!harness.cached(Stage::Detection, "ch1_stage_final.png"));
    assert!(harness.cached(Stage::Detection, "other.png"));
    assert_eq!(harness.pipeline.clear_cache(Some("ch1_stage_final.png")), 0);

    assert_eq!(harness.pipeline.clear_cache(None), 4);
    assert_eq!(harness.pipeline.get_progress("other.png").completed_stages, 0);
}

#[tokio::test]
async fn first_term_mapping_wins_across_pages() {
    let mut harness = Harness::new(HarnessOptions {
        terms: vec![
            BTreeMap::from([("ナルト".to_string(), "鸣人".to_string())]),
            BTreeMap::from([
                ("ナルト".to_string(), "鸣门".to_string()),
                ("サスケ".to_string(), "佐助".to_string()),
            ]),
        ],
        ..HarnessOptions::default()
    });
    let first = harness.page("in", "001.png");
    let second = harness.page("in", "002.png");

    let report = harness
        .pipeline
        .process_image(&first, None, ProcessOptions::default())
        .await;
    assert_eq!(report.added_terms, 1);
    let report = harness
        .pipeline
        .process_image(&second, None, ProcessOptions::default())
        .await;
    assert_eq!(report.new_terminology_count, 2);
    assert_eq!(report.added_terms, 1);

    let store = harness.pipeline.terminology();
    assert_eq!(store.get_term("ナルト"), Some("鸣人"));
    assert_eq!(store.get_term("サスケ"), Some("佐助"));

    let reopened = TerminologyStore::open(harness.root.join("terminology_dict.json"));
    assert_eq!(reopened.len(), 2);

    let info = harness.pipeline.system_info();
    assert_eq!(info.terminology.total_terms, 2);
    assert_eq!(info.model, "stub:model");
}
