use deep_harmonization as dh;

fn main() -> Result<(), dh::Error> {
    // the extractor is read only, one instance can serve any number of sessions
    let extractor = dh::FeatureExtractor::vgg19(0);

    let session = dh::Session::builder()
        // the structure inside the mask comes from the content
        .content(&"imgs/content.png")
        // the texture, and everything outside the mask, comes from the style
        .style(&"imgs/style.png")
        // white is harmonized, black is kept from the style image
        .mask(&"imgs/mask.png")
        // all three inputs must have the same size, so force one
        .resize_input(dh::Dims::square(256))
        .num_steps(200)
        .build()?;

    let harmonized = session.run(&extractor, None)?;

    // save the result to the disk
    harmonized.save("out/01.png")
}
