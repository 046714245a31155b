//! Moving parameters to their planned devices.

use sparq_core::{Device, Error, Model, Result};
use tracing::info;

use crate::offload::OffloadStore;
use crate::strategy::DeviceMap;
use crate::units::unit_of;

/// Places every parameter on the device of its unit.
///
/// Parameters mapped to disk are written to `offload` and their in-memory
/// storage is dropped. A placeholder parameter is accepted only when it is
/// mapped to disk and already present in the store.
pub fn dispatch(model: &mut Model, map: &DeviceMap, offload: &mut OffloadStore) -> Result<()> {
    let targets: Vec<(String, Device)> = model
        .parameter_names()
        .into_iter()
        .map(|name| {
            let unit = unit_of(model, &name);
            map.get(&unit)
                .map(|device| (name.clone(), device))
                .ok_or_else(|| {
                    Error::placement(format!("no device for '{name}' (unit '{unit}')"))
                })
        })
        .collect::<Result<_>>()?;

    for (name, device) in targets {
        let Some(tensor) = model.get_mut(&name) else {
            continue;
        };
        if tensor.is_meta() {
            if device != Device::Disk || !offload.contains(&name) {
                return Err(Error::precondition(format!(
                    "'{name}' has no storage to dispatch to {device}"
                )));
            }
        } else if device == Device::Disk {
            offload.write(&name, tensor)?;
            tensor.take_data();
        }
        tensor.device = device;
    }

    for (device, bytes) in model.footprint() {
        info!("dispatched {} bytes to {}", bytes, device);
    }
    Ok(())
}
