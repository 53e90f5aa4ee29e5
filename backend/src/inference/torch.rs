use std::sync::Mutex;
use tch::{CModule, Device, Kind, Tensor};

use super::{ImageModel, ModelError};
use crate::pipeline::ImageTensor;

/// TorchScript classifier. The module sits behind a mutex so only the forward
/// pass is serialized; preprocessing of other images continues in parallel.
pub struct TorchModel {
    name: String,
    device: Device,
    module: Mutex<CModule>,
}

impl TorchModel {
    pub fn load(name: &str, model_path: &str) -> Result<Self, ModelError> {
        let device = Device::cuda_if_available();
        log::info!("Loading TorchScript model {} on {:?}", model_path, device);
        let module = CModule::load_on_device(model_path, device)
            .map_err(|e| ModelError::Load(format!("{}: {}", model_path, e)))?;
        Ok(Self {
            name: name.to_string(),
            device,
            module: Mutex::new(module),
        })
    }
}

impl ImageModel for TorchModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data = input
            .as_slice()
            .ok_or_else(|| ModelError::Backend("input tensor is not contiguous".into()))?;
        let tensor = Tensor::from_slice(data).reshape(&shape).to_device(self.device);

        let output = {
            let module = self.module.lock().map_err(|_| ModelError::Poisoned)?;
            module
                .forward_ts(&[tensor])
                .map_err(|e| ModelError::Backend(e.to_string()))?
        };

        let probabilities = output
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .view([-1]);
        let num_elements = probabilities.size()[0] as usize;
        let mut scores = vec![0.0f32; num_elements];
        probabilities.copy_data(&mut scores, num_elements);
        Ok(scores)
    }
}
