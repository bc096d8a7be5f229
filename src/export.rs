//! Model export and import.
//!
//! An export directory holds `model.json` (architecture and weights) and
//! `config.toml` (the configuration the model was trained with). Tensors are
//! stored as `{"shape": [...], "data": [...]}` in row-major order. Conv
//! kernels have shape `(out_channels, in_channels * k * k)` with columns
//! ordered `(channel, ky, kx)`, dense kernels `(inputs, outputs)`.

use std::fs;
use std::path::Path;

use json::JsonValue;
use ndarray::{Array, Array1, Array2, Dimension, Ix1, Ix2, IxDyn};

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::model::conv_net::ConvNet;
use crate::model::layers::{BatchNorm2d, Conv2d, Dense, Flatten, Layer, MaxPool2d, Relu};

pub const MODEL_FILE: &str = "model.json";
pub const CONFIG_FILE: &str = "config.toml";
const FORMAT_VERSION: usize = 1;

/// Write the model and its training configuration into `dir`, creating it if needed
pub fn export(model: &ConvNet, config: &TrainConfig, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;

    let model_path = dir.join(MODEL_FILE);
    fs::write(&model_path, model_to_json(model)?.pretty(2))
        .map_err(|err| Error::io(&model_path, err))?;

    let config_path = dir.join(CONFIG_FILE);
    fs::write(&config_path, toml::to_string_pretty(config)?)
        .map_err(|err| Error::io(&config_path, err))?;

    tracing::info!("Exported model to {}", dir.display());

    Ok(())
}

/// Rebuild a network from an export directory
pub fn load(dir: &Path) -> Result<ConvNet> {
    let model_path = dir.join(MODEL_FILE);
    let contents = fs::read_to_string(&model_path).map_err(|err| Error::io(&model_path, err))?;
    let data = json::parse(&contents)?;

    let version = field_usize(&data, "format_version")?;
    if version != FORMAT_VERSION {
        return Err(Error::InvalidModel(format!(
            "unsupported format version {version}"
        )));
    }

    let shape = usize_list(&data["input_shape"], "input_shape")?;
    let input_shape = match shape.as_slice() {
        [c, h, w] => (*c, *h, *w),
        _ => return Err(Error::InvalidModel("input_shape must have 3 entries".to_string())),
    };
    let num_classes = field_usize(&data, "num_classes")?;

    let layers = data["layers"]
        .members()
        .map(layer_from_json)
        .collect::<Result<Vec<_>>>()?;

    ConvNet::from_layers(layers, input_shape, num_classes)
}

fn model_to_json(model: &ConvNet) -> Result<JsonValue> {
    let (c, h, w) = model.input_shape();
    let mut data = JsonValue::new_object();
    data["format_version"] = FORMAT_VERSION.into();
    data["input_shape"] = vec![c, h, w].into();
    data["num_classes"] = model.num_classes().into();

    let mut layers = JsonValue::new_array();
    for layer in &model.layers {
        layers.push(layer_to_json(layer))?;
    }
    data["layers"] = layers;

    Ok(data)
}

fn tensor_to_json<D: Dimension>(tensor: &Array<f32, D>) -> JsonValue {
    let mut data = JsonValue::new_object();
    data["shape"] = tensor.shape().to_vec().into();
    data["data"] = tensor.iter().copied().collect::<Vec<f32>>().into();
    data
}

fn layer_to_json(layer: &Layer) -> JsonValue {
    let mut data = JsonValue::new_object();
    data["type"] = layer.name().into();

    match layer {
        Layer::Conv2d(conv) => {
            data["kernel_size"] = conv.kernel_size.into();
            data["weights"] = tensor_to_json(&conv.weights);
            data["bias"] = tensor_to_json(&conv.bias);
        }
        Layer::BatchNorm2d(norm) => {
            data["momentum"] = norm.momentum.into();
            data["epsilon"] = norm.epsilon.into();
            data["gamma"] = tensor_to_json(&norm.gamma);
            data["beta"] = tensor_to_json(&norm.beta);
            data["moving_mean"] = tensor_to_json(&norm.moving_mean);
            data["moving_variance"] = tensor_to_json(&norm.moving_variance);
        }
        Layer::Dense(dense) => {
            data["weights"] = tensor_to_json(&dense.weights);
            data["bias"] = tensor_to_json(&dense.bias);
        }
        Layer::Relu(_) | Layer::MaxPool2d(_) | Layer::Flatten(_) => {}
    }

    data
}

fn field_usize(data: &JsonValue, key: &str) -> Result<usize> {
    data[key]
        .as_usize()
        .ok_or_else(|| Error::InvalidModel(format!("missing or invalid `{key}`")))
}

/// Read a number as the f32 nearest to its decimal text.
/// `JsonValue::as_f32` goes through an inexact power-of-ten scaling and can land on a neighbouring float.
fn number_f32(value: &JsonValue) -> Option<f32> {
    value.as_number()?.to_string().parse().ok()
}

fn field_f32(data: &JsonValue, key: &str) -> Result<f32> {
    number_f32(&data[key])
        .ok_or_else(|| Error::InvalidModel(format!("missing or invalid `{key}`")))
}

fn usize_list(data: &JsonValue, key: &str) -> Result<Vec<usize>> {
    if !data.is_array() {
        return Err(Error::InvalidModel(format!("`{key}` must be an array")));
    }
    data.members()
        .map(|v| {
            v.as_usize()
                .ok_or_else(|| Error::InvalidModel(format!("`{key}` holds a non-integer")))
        })
        .collect()
}

fn tensor_from_json<D: Dimension>(data: &JsonValue, key: &str) -> Result<Array<f32, D>> {
    let tensor = &data[key];
    let shape = usize_list(&tensor["shape"], key)?;
    let values = tensor["data"]
        .members()
        .map(|v| {
            number_f32(v).ok_or_else(|| Error::InvalidModel(format!("`{key}` holds a non-number")))
        })
        .collect::<Result<Vec<f32>>>()?;

    let array = Array::from_shape_vec(IxDyn(&shape), values)
        .map_err(|err| Error::InvalidModel(format!("`{key}`: {err}")))?;
    array
        .into_dimensionality::<D>()
        .map_err(|err| Error::InvalidModel(format!("`{key}`: {err}")))
}

fn layer_from_json(data: &JsonValue) -> Result<Layer> {
    let kind = data["type"]
        .as_str()
        .ok_or_else(|| Error::InvalidModel("layer without a `type`".to_string()))?;

    let layer = match kind {
        Conv2d::NAME => {
            let weights: Array2<f32> = tensor_from_json::<Ix2>(data, "weights")?;
            let bias: Array1<f32> = tensor_from_json::<Ix1>(data, "bias")?;
            let kernel_size = field_usize(data, "kernel_size")?;
            if kernel_size == 0
                || weights.ncols() % (kernel_size * kernel_size) != 0
                || bias.len() != weights.nrows()
            {
                return Err(Error::InvalidModel(
                    "conv2d weights do not match kernel size or bias".to_string(),
                ));
            }
            Layer::Conv2d(Conv2d::from_parts(weights, bias, kernel_size))
        }
        BatchNorm2d::NAME => {
            let gamma: Array1<f32> = tensor_from_json::<Ix1>(data, "gamma")?;
            let mut norm = BatchNorm2d::new(gamma.len());
            norm.momentum = field_f32(data, "momentum")?;
            norm.epsilon = field_f32(data, "epsilon")?;
            norm.beta = tensor_from_json::<Ix1>(data, "beta")?;
            norm.moving_mean = tensor_from_json::<Ix1>(data, "moving_mean")?;
            norm.moving_variance = tensor_from_json::<Ix1>(data, "moving_variance")?;
            norm.gamma = gamma;
            if [&norm.beta, &norm.moving_mean, &norm.moving_variance]
                .iter()
                .any(|t| t.len() != norm.channels)
            {
                return Err(Error::InvalidModel(
                    "batch_norm2d tensors disagree on channel count".to_string(),
                ));
            }
            Layer::BatchNorm2d(norm)
        }
        Dense::NAME => {
            let weights: Array2<f32> = tensor_from_json::<Ix2>(data, "weights")?;
            let bias: Array1<f32> = tensor_from_json::<Ix1>(data, "bias")?;
            if bias.len() != weights.ncols() {
                return Err(Error::InvalidModel("dense bias does not match weights".to_string()));
            }
            Layer::Dense(Dense::from_parts(weights, bias))
        }
        Relu::NAME => Layer::Relu(Relu::default()),
        MaxPool2d::NAME => Layer::MaxPool2d(MaxPool2d::default()),
        Flatten::NAME => Layer::Flatten(Flatten::default()),
        other => {
            return Err(Error::InvalidModel(format!("unknown layer type `{other}`")));
        }
    };

    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelConfig};
    use ndarray::Array4;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn small_model() -> ConvNet {
        let config = ModelConfig {
            conv_filters: vec![3, 5],
            hidden_units: 8,
            ..ModelConfig::default()
        };
        ConvNet::new(&config, &mut StdRng::seed_from_u64(11)).unwrap()
    }

    #[test]
    fn exported_model_predicts_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = small_model();
        if let Layer::BatchNorm2d(norm) = &mut model.layers[1] {
            norm.moving_mean.fill(0.25);
            norm.moving_variance.fill(2.0);
        }

        export(&model, &TrainConfig::default(), dir.path()).unwrap();
        let loaded = load(dir.path()).unwrap();

        let images = Array4::from_shape_fn((2, 1, 28, 28), |(n, _, y, x)| {
            ((n + y * x) % 13) as f32 / 13.0
        });
        assert_eq!(
            model.predict(&images.view()).unwrap(),
            loaded.predict(&images.view()).unwrap()
        );
        assert_eq!(loaded.num_params(), model.num_params());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn tensors_reload_bit_exact() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut values: Vec<f32> = (0..2000).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        values.extend([
            -0.208_917_72,
            0.087_488_465,
            f32::MIN_POSITIVE,
            f32::MAX,
            -f32::EPSILON,
            1e-30,
            0.0,
        ]);
        let tensor = Array1::from(values);

        let mut data = JsonValue::new_object();
        data["tensor"] = tensor_to_json(&tensor);
        let parsed = json::parse(&data.dump()).unwrap();
        let reloaded: Array1<f32> = tensor_from_json::<Ix1>(&parsed, "tensor").unwrap();

        for (a, b) in tensor.iter().zip(reloaded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits(), "{a} reloaded as {b}");
        }
    }

    #[test]
    fn exported_config_parses_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig::default();
        export(&small_model(), &config, dir.path()).unwrap();

        let parsed = TrainConfig::from_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn unknown_layer_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(MODEL_FILE),
            r#"{"format_version": 1, "input_shape": [1, 28, 28], "num_classes": 10,
                "layers": [{"type": "dropout"}]}"#,
        )
        .unwrap();

        assert!(matches!(load(dir.path()), Err(Error::InvalidModel(_))));
    }

    #[test]
    fn missing_export_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load(&dir.path().join("absent")), Err(Error::Io { .. })));
    }
}
