use std::sync::Arc;
use style_synthesis as ss;

fn main() -> Result<(), ss::Error> {
    // load pretrained weights, converted to the style-synthesis weights format
    let backbone = Arc::new(ss::Backbone::open("weights/vgg19.weights")?);

    //create a new session
    let session = ss::Session::builder()
        //load the image whose style will be synthesized
        .style_image(&"imgs/style.jpg")
        .backbone(backbone)
        .build()?;

    //synthesize an image with the default 10 iterations
    let generated = session.run(None)?;

    for (i, loss) in generated.loss_history().iter().enumerate() {
        println!("iteration {}: {}", i + 1, loss);
    }

    //save the image to the disk
    generated.save("out/01.png")
}
