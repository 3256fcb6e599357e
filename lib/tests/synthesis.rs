use std::sync::{Arc, Mutex};
use style_synthesis as ss;

fn backbone() -> Arc<ss::Backbone> {
    Arc::new(ss::Backbone::from_layout(
        &ss::Layout::new(vec![vec![4], vec![6, 6], vec![8]]),
        7,
    ))
}

fn style_image(width: u32, height: u32) -> ss::image::DynamicImage {
    let img = ss::image::ImageBuffer::from_fn(width, height, |x, y| {
        let stripe = if (x + 2 * y) % 5 < 2 { 220 } else { 30 };
        ss::image::Rgb([stripe, ((x * 13) % 256) as u8, (255 - y * 9) as u8])
    });
    ss::image::DynamicImage::ImageRgb8(img)
}

#[test]
fn loss_history_per_iteration() {
    let generated = ss::Session::builder()
        .style_image(style_image(256, 256))
        .backbone(backbone())
        .seed(0)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let losses = generated.loss_history();
    assert_eq!(losses.len(), 10);
    assert!(losses.iter().all(|l| l.is_finite() && *l >= 0.0));
    assert!(losses[9] <= losses[0], "{:?}", losses);

    // the candidate has to move well away from the initial noise
    let decrease = (losses[0] - losses[9]) / losses[0];
    assert!(decrease > 0.01, "relative decrease {} in {:?}", decrease, losses);

    assert_eq!(generated.dims(), ss::Dims::square(256));
    assert_eq!(generated.as_tensor().len(), 256 * 256 * 3);
}

#[test]
fn clipped_after_every_iteration() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let progress = move |update: ss::ProgressUpdate<'_>| {
        let max = update
            .candidate
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()));
        assert_eq!(update.candidate.len(), update.shape.len());
        assert!(update.evaluations.current <= update.evaluations.total);

        sink.lock().unwrap().push((update.total.current, max, update.loss));
    };

    let generated = ss::Session::builder()
        .style_image(style_image(12, 12))
        .backbone(backbone())
        .iterations(4)
        .max_evaluations(8)
        .build()
        .unwrap()
        .run(Some(Box::new(progress)))
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 4);

    for (i, (iteration, max, loss)) in seen.iter().enumerate() {
        assert_eq!(*iteration, i + 1);
        assert!(*max <= ss::PIXEL_LIMIT);
        assert_eq!(*loss, generated.loss_history()[i]);
    }
}

macro_rules! output_shape {
    ($name:ident, [$($layer:expr),*]) => {
        #[test]
        fn $name() {
            let session = ss::Session::builder()
                .style_image(style_image(12, 8))
                .backbone(backbone())
                .layers(vec![$($layer),*])
                .iterations(1)
                .max_evaluations(3)
                .build()
                .unwrap();

            assert!(session.style_layers().eq(vec![$($layer),*]));

            let generated = session.run(None).unwrap();
            assert_eq!(generated.dims(), ss::Dims::new(12, 8));

            let img = generated.into_image();
            assert_eq!(ss::image::GenericImageView::dimensions(&img), (12, 8));
        }
    };
}

output_shape!(shallow_layer, ["block1_conv1"]);
output_shape!(deep_layer, ["block3_conv1"]);
output_shape!(mixed_layers, ["block2_conv2", "block1_conv1", "block2_pool"]);

#[test]
fn default_layers() {
    let session = ss::Session::builder()
        .style_image(style_image(8, 8))
        .backbone(backbone())
        .build()
        .unwrap();

    assert!(session
        .style_layers()
        .eq(vec!["block1_conv1", "block2_conv1", "block3_conv1"]));
}

#[test]
fn missing_layer() {
    let result = ss::Session::builder()
        .style_image(style_image(8, 8))
        .backbone(backbone())
        .layers(vec!["block1_conv1", "block4_conv1"])
        .build();

    match result {
        Err(err) => {
            assert_eq!(err.stage(), Some(ss::Stage::TargetComputation));
            match err.root() {
                ss::Error::MissingLayer(name) => assert_eq!(name, "block4_conv1"),
                other => panic!("unexpected error {}", other),
            }
        }
        Ok(_) => panic!("built a session with a missing layer"),
    }
}

#[test]
fn style_image_too_small() {
    // 3 pooling layers need at least 8x8
    match ss::Session::builder()
        .style_image(style_image(6, 6))
        .backbone(backbone())
        .build()
    {
        Err(err) => {
            assert_eq!(err.stage(), Some(ss::Stage::ExtractorConstruction));
            assert!(matches!(err.root(), ss::Error::ShapeMismatch(_)));
        }
        Ok(_) => panic!("built a session for an image smaller than the pooling windows"),
    }
}

#[test]
fn mismatched_layer_weights() {
    let result = ss::Session::builder()
        .style_image(style_image(8, 8))
        .backbone(backbone())
        .layers(vec!["block1_conv1", "block2_conv1"])
        .layer_weights(vec![1.0])
        .build();

    assert!(matches!(
        result.map(|_| ()).map_err(|e| e.stage()),
        Err(Some(ss::Stage::TargetComputation))
    ));
}

#[test]
fn deterministic_across_threads() {
    let run = |threads: usize| {
        ss::Session::builder()
            .style_image(style_image(8, 8))
            .backbone(backbone())
            .iterations(2)
            .max_evaluations(5)
            .seed(42)
            .max_thread_count(threads)
            .build()
            .unwrap()
            .run(None)
            .unwrap()
    };

    let single = run(1);
    let multi = run(4);

    assert_eq!(single.loss_history(), multi.loss_history());
    assert_eq!(single.as_tensor(), multi.as_tensor());
}

#[test]
fn early_stop() {
    let generated = ss::Session::builder()
        .style_image(style_image(8, 8))
        .backbone(backbone())
        .iterations(50)
        .max_evaluations(2)
        // any macro-iteration improving by less than 100% stops the run
        .convergence_tolerance(1.0)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert_eq!(generated.loss_history().len(), 2);
}

#[test]
fn resized_style_image() {
    let generated = ss::Session::builder()
        .style_image(style_image(20, 10))
        .backbone(backbone())
        .resize_input(ss::Dims::new(9, 11))
        .iterations(1)
        .max_evaluations(2)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert_eq!(generated.dims(), ss::Dims::new(9, 11));
}

#[test]
fn weights_file_round_trip() {
    let original = backbone();

    let mut buffer = Vec::new();
    original.write(&mut buffer).unwrap();
    let loaded = Arc::new(ss::Backbone::read(&mut std::io::Cursor::new(&buffer)).unwrap());
    assert_eq!(loaded.parameter_count(), original.parameter_count());

    let style = style_image(8, 8).to_rgb();
    let layers = ["block1_conv1", "block3_conv1"];

    let objective = |backbone: Arc<ss::Backbone>| {
        let input = ss::preprocess(&style, &backbone.preprocessing());
        let extractor = ss::FeatureExtractor::build(backbone, input.shape(), 1).unwrap();
        let targets = ss::StyleTargetSet::compute(&extractor, &input, &layers, None).unwrap();
        ss::StyleObjective::new(Arc::new(extractor), targets).unwrap()
    };

    let x: Vec<f64> = (0..8 * 8 * 3).map(|i| (i as f64 * 0.37).cos() * 20.0).collect();
    let (a, grad_a) = objective(original).evaluate(&x).unwrap();
    let (b, grad_b) = objective(loaded).evaluate(&x).unwrap();

    // weights are stored as f32
    assert!((a - b).abs() <= 1e-4 * a.abs(), "{} vs {}", a, b);
    assert_eq!(grad_a.len(), grad_b.len());
}

#[test]
fn unbounded_iterations_with_early_stop() {
    let generated = ss::Session::builder()
        .style_image(style_image(8, 8))
        .backbone(backbone())
        .iterations(u32::MAX)
        .max_evaluations(2)
        .convergence_tolerance(1.0)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert_eq!(generated.loss_history().len(), 2);
}
