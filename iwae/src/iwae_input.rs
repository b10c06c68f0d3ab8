use iwae_util::candle_core::Tensor;
use iwae_util::candle_data_loader::*;
use log::info;

pub struct ImageDataPair {
    pub train: InMemoryData,
    pub test: InMemoryData,
    /// shape of one image
    pub x_dim: Vec<usize>,
}

pub struct ReadImageArgs<'a> {
    pub train_file: &'a str,
    pub test_file: &'a str,
    pub train_label_file: Option<&'a str>,
    pub test_label_file: Option<&'a str>,
    pub x_dim: Option<&'a [usize]>,
    pub center: bool,
    pub seed: u64,
}

///
/// Read train and test images (with optional labels), check both agree
/// on the per-image shape and, if asked, subtract the training mean
/// image from both.
///
pub fn read_image_data(args: &ReadImageArgs) -> anyhow::Result<ImageDataPair> {
    let train_x = read_image_tensor(args.train_file)?;
    let test_x = read_image_tensor(args.test_file)?;

    info!("train images: {:?}, test images: {:?}", train_x.dims(), test_x.dims());

    if train_x.rank() < 2 || test_x.rank() < 2 {
        return Err(anyhow::anyhow!("expected (samples x image dims...) tensors"));
    }

    let x_dim = train_x.dims()[1..].to_vec();
    if test_x.dims()[1..] != x_dim[..] {
        return Err(anyhow::anyhow!(
            "train {:?} and test {:?} images differ in shape",
            train_x.dims(),
            test_x.dims()
        ));
    }

    if let Some(expected) = args.x_dim {
        if expected != x_dim.as_slice() {
            return Err(anyhow::anyhow!(
                "images are {:?}, but x_dim = {:?} was requested",
                x_dim,
                expected
            ));
        }
    }

    let (train_x, test_x) = if args.center {
        let mu = mean_image(&train_x)?;
        info!("centering by the training mean image");
        (center_images(&train_x, &mu)?, center_images(&test_x, &mu)?)
    } else {
        (train_x, test_x)
    };

    let read_labels = |file: Option<&str>| -> anyhow::Result<Option<Tensor>> {
        file.map(read_label_tensor).transpose()
    };

    let train = InMemoryData::new(train_x, read_labels(args.train_label_file)?, args.seed)?;
    let test = InMemoryData::new(test_x, read_labels(args.test_label_file)?, args.seed)?;

    Ok(ImageDataPair { train, test, x_dim })
}
