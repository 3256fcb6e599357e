use std::sync::Arc;
use style_synthesis as ss;

fn main() -> Result<(), ss::Error> {
    // a VGG19 shaped network with random weights, which still yields
    // surprisingly texture-like output
    let backbone = ss::Backbone::from_layout(&ss::Layout::vgg19(), 0);

    // save it so it can be reused with the cli's --backbone
    backbone.save("out/random_vgg19.weights")?;

    let session = ss::Session::builder()
        .style_image(&"imgs/style.jpg")
        .backbone(Arc::new(backbone))
        .resize_input(ss::Dims::square(128))
        .build()?;

    let generated = session.run(None)?;

    generated.save("out/03.png")
}
