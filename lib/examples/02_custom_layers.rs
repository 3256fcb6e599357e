use std::sync::Arc;
use style_synthesis as ss;

fn main() -> Result<(), ss::Error> {
    let backbone = Arc::new(ss::Backbone::open("weights/vgg19.weights")?);

    let session = ss::Session::builder()
        .style_image(&"imgs/style.jpg")
        .backbone(backbone)
        // shallow layers capture fine grained texture, deep ones larger
        // structures, so favor the deeper end here
        .layers(vec!["block1_conv1", "block3_conv1", "block5_conv1"])
        .layer_weights(vec![0.5, 1.0, 2.0])
        .resize_input(ss::Dims::square(256))
        .iterations(20)
        .max_evaluations(40)
        .seed(7)
        .build()?;

    let progress = |update: ss::ProgressUpdate<'_>| {
        println!(
            "{}/{} loss {:.4} after {:?}",
            update.total.current, update.total.total, update.loss, update.elapsed
        );
    };

    let generated = session.run(Some(Box::new(progress)))?;

    generated.save("out/02.png")
}
