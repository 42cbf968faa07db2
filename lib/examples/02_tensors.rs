use deep_harmonization as dh;
use dh::ndarray::Array4;

fn main() -> Result<(), dh::Error> {
    let extractor = dh::FeatureExtractor::vgg19(0);

    // inputs that are already decoded can skip the session entirely
    let content = Array4::from_shape_fn((1, 3, 64, 64), |(_, c, y, x)| {
        0.5 + 0.4 * ((x + c * 7) as f32 * 0.2).sin() * (y as f32 * 0.1).cos()
    });
    let style = Array4::from_shape_fn((1, 3, 64, 64), |(_, c, y, x)| {
        if (x / 8 + y / 8 + c) % 2 == 0 {
            0.8
        } else {
            0.2
        }
    });
    let mask = Array4::from_shape_fn((1, 1, 64, 64), |(_, _, y, x)| {
        if (16..48).contains(&y) && (16..48).contains(&x) {
            1.0
        } else {
            0.0
        }
    });

    let params = dh::Parameters {
        num_steps: 50,
        ..dh::Parameters::default()
    };

    let synthesis = dh::synthesize(
        &extractor,
        &content,
        &style,
        &mask,
        &params,
        Some(Box::new(|update: dh::ProgressUpdate<'_>| {
            if update.evaluation.current % 10 == 0 {
                println!(
                    "evaluation {}/{}: style {:.4} content {:.4}",
                    update.evaluation.current,
                    update.evaluation.total,
                    update.style_score,
                    update.content_score
                );
            }
        })),
    )?;

    println!(
        "stopped after {} iterations: {:?}",
        synthesis.report.iterations, synthesis.report.termination
    );

    // the result is also available as a data URL, eg. for a JSON response
    let url = dh::encode_data_url(&synthesis.image)?;
    println!("{}...", &url[..40]);

    std::fs::create_dir_all("out")?;
    dh::tensor_to_image(&synthesis.image)?.save("out/02.png")?;

    Ok(())
}
