use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::core::volume::VolumeEnumerator;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxEnumerator, LinuxEnumeratorConfig};
pub use simulated::{SimulatedEnumerator, Simulator};

/// Pick the volume enumerator for this platform.
///
/// In simulation mode the enumerator is fed from stdin: `add <path> [label]`
/// attaches a volume and `rm <path>` detaches it.
pub fn get_enumerator(simulation: bool) -> Arc<dyn VolumeEnumerator> {
    if simulation {
        let (enumerator, controller) = SimulatedEnumerator::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines() {
                let Ok(cmd) = line else { break };
                run_simulator_command(&controller, &cmd);
            }
        });

        info!("Simulation mode: use 'add <path> [label]' or 'rm <path>' on stdin");
        return Arc::new(enumerator);
    }

    platform_enumerator()
}

fn run_simulator_command(controller: &Simulator, cmd: &str) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    match parts.as_slice() {
        ["add", path] => {
            let label = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            controller.add_volume(*path, &label);
        }
        ["add", path, label] => controller.add_volume(*path, label),
        ["rm", path] => controller.remove_volume(Path::new(path)),
        ["fail"] => controller.set_failing(true),
        ["recover"] => controller.set_failing(false),
        [] => {}
        _ => println!("(Simulator) Use: 'add <path> [label]' or 'rm <path>'"),
    }
}

#[cfg(target_os = "linux")]
fn platform_enumerator() -> Arc<dyn VolumeEnumerator> {
    Arc::new(LinuxEnumerator::with_defaults())
}

#[cfg(not(target_os = "linux"))]
fn platform_enumerator() -> Arc<dyn VolumeEnumerator> {
    tracing::warn!("No volume enumerator for this platform, nothing will be detected");
    Arc::new(Unsupported)
}

#[cfg(not(target_os = "linux"))]
struct Unsupported;

#[cfg(not(target_os = "linux"))]
impl VolumeEnumerator for Unsupported {
    fn list_volumes(&self) -> Result<Vec<crate::core::models::Volume>, crate::core::volume::EnumerationError> {
        Err(crate::core::volume::EnumerationError::Other(
            "volume enumeration is not supported on this platform".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_simulator_commands() {
        let (enumerator, controller) = SimulatedEnumerator::new();

        run_simulator_command(&controller, "add /tmp/cards/EOS");
        run_simulator_command(&controller, "add /tmp/cards/NIKON D750");
        let volumes = enumerator.list_volumes().unwrap();
        assert_eq!(volumes[0].label, "EOS");
        assert_eq!(volumes[1].path, PathBuf::from("/tmp/cards/NIKON"));
        assert_eq!(volumes[1].label, "D750");

        run_simulator_command(&controller, "fail");
        assert!(enumerator.list_volumes().is_err());
        run_simulator_command(&controller, "recover");

        run_simulator_command(&controller, "rm /tmp/cards/EOS");
        run_simulator_command(&controller, "bogus");
        assert_eq!(enumerator.list_volumes().unwrap().len(), 1);
    }
}
