//! Pod and volume manifests for user environments.
//!
//! Two pod templates exist. The first-boot template runs an init container
//! from a pre-baked image that seeds the user's home and moves the bundled
//! toolchain onto the volume. The steady-state template installs the
//! toolchain from the network only when it is missing. Both share the same
//! shell container (and optional container-runtime sidecar).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, ExecAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe,
    SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::INIT_CONTAINER;

/// Numeric uid/gid of the user inside every pod. Pods are single-tenant.
pub const USER_UID: u32 = 10000;

pub const SHELL_CONTAINER: &str = "shell";
pub const SIDECAR_CONTAINER: &str = "dind";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const USER_LABEL: &str = "boombox.dev/user";

/// Marker written by the shell container once the user account exists.
pub const READY_MARKER: &str = "/tmp/boombox.ready";

const HOME_VOLUME: &str = "home";
const RUNTIME_SOCKET_VOLUME: &str = "dind-socket";
const RUNTIME_SOCKET_DIR: &str = "/var/run/dind";

const PROBE_PERIOD_SECS: i32 = 2;
const PROBE_FAILURE_THRESHOLD: i32 = 450;

const FIRST_BOOT_INIT_SCRIPT: &str = r#"
echo 'Creating user home';
if [ ! -d /home/{Username} ]; then mkdir /home/{Username}; chown -R {UID}:{UID} /home/{Username}; fi;
if [ ! -d /home/linuxbrew ]; then
  echo 'Copying homebrew installation...';
  mv /opt/linuxbrew /home/linuxbrew;
  chown -R {UID}:{UID} /home/linuxbrew;
fi;
"#;

const STEADY_STATE_INIT_SCRIPT: &str = r#"
if [ ! -d /home/{Username} ]; then mkdir /home/{Username}; chown -R {UID}:{UID} /home/{Username}; fi;
if [ ! -d /home/linuxbrew ]; then
  apt-get update; apt-get install -y curl git;
  NONINTERACTIVE=1 /bin/bash -c "$(curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh)";
  /home/linuxbrew/.linuxbrew/bin/brew install curl git man-db;
  chown -R {UID}:{UID} /home/linuxbrew;
fi;
"#;

const PROFILE_SCRIPT: &str = r#"
echo 'eval "$(/home/linuxbrew/.linuxbrew/bin/brew shellenv)"; export PATH=/home/linuxbrew/.linuxbrew/opt/man-db/libexec/bin:$PATH' > /etc/profile.d/99-linuxbrew.sh;
"#;

const RUNTIME_PROFILE_SCRIPT: &str = r#"
echo 'export DOCKER_HOST={DockerHost}' > /etc/profile.d/99-docker.sh;
"#;

const SHELL_SCRIPT: &str = r#"
useradd -d /home/{Username} -M {Username} -u {UID} -s "$([ -f /home/{Username}/.boombox_shell ] && cat /home/{Username}/.boombox_shell || echo /bin/bash)";
touch {ReadyMarker};
tail -f /dev/null;
"#;

/// Settings shared by every pod this process creates.
#[derive(Debug, Clone)]
pub struct PodTemplate {
    pub namespace: String,
    /// Repository of the pre-baked first-boot image; tagged with the
    /// configured image tag.
    pub init_image_repository: String,
    /// Image of the privileged container-runtime sidecar, if enabled.
    pub sidecar_image: Option<String>,
}

impl PodTemplate {
    /// Build the pod manifest for `name`.
    ///
    /// `first_boot` alone selects the init template; no cluster state is
    /// consulted.
    pub fn pod(&self, name: &str, image: &str, volume_name: &str, first_boot: bool) -> Pod {
        let init = if first_boot {
            Container {
                name: INIT_CONTAINER.to_string(),
                image: Some(format!("{}:{}", self.init_image_repository, image)),
                image_pull_policy: Some("IfNotPresent".to_string()),
                args: Some(shell_args(&render(FIRST_BOOT_INIT_SCRIPT, name))),
                volume_mounts: Some(vec![home_mount()]),
                ..Default::default()
            }
        } else {
            Container {
                name: INIT_CONTAINER.to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("Always".to_string()),
                args: Some(shell_args(&render(STEADY_STATE_INIT_SCRIPT, name))),
                volume_mounts: Some(vec![home_mount()]),
                ..Default::default()
            }
        };

        let mut containers = vec![self.shell_container(name, image)];
        let mut volumes = vec![Volume {
            name: HOME_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: volume_name.to_string(),
                read_only: None,
            }),
            ..Default::default()
        }];

        if let Some(sidecar_image) = &self.sidecar_image {
            containers.push(Container {
                name: SIDECAR_CONTAINER.to_string(),
                image: Some(sidecar_image.clone()),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: RUNTIME_SOCKET_VOLUME.to_string(),
                    mount_path: "/var/run".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
            volumes.push(Volume {
                name: RUNTIME_SOCKET_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    size_limit: None,
                }),
                ..Default::default()
            });
        }

        Pod {
            metadata: self.metadata(name),
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                init_containers: Some(vec![init]),
                containers,
                volumes: Some(volumes),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Build the home-volume claim for `name`.
    pub fn volume(&self, name: &str, size: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: self.metadata(name),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn shell_container(&self, name: &str, image: &str) -> Container {
        let mut script = String::from(PROFILE_SCRIPT);
        let mut env = vec![
            env_var("HOMEBREW_FORCE_BREWED_CURL", "1"),
            env_var("HOMEBREW_CURL_PATH", "/home/linuxbrew/.linuxbrew/bin/curl"),
            env_var("LANG", "en_US.UTF-8"),
        ];
        let mut mounts = vec![home_mount()];

        if self.sidecar_image.is_some() {
            let docker_host = format!("unix://{RUNTIME_SOCKET_DIR}/docker.sock");
            script.push_str(&RUNTIME_PROFILE_SCRIPT.replace("{DockerHost}", &docker_host));
            env.push(env_var("DOCKER_HOST", &docker_host));
            mounts.push(VolumeMount {
                name: RUNTIME_SOCKET_VOLUME.to_string(),
                mount_path: RUNTIME_SOCKET_DIR.to_string(),
                ..Default::default()
            });
        }
        script.push_str(&render(SHELL_SCRIPT, name));

        Container {
            name: SHELL_CONTAINER.to_string(),
            image: Some(image.to_string()),
            stdin: Some(true),
            tty: Some(true),
            args: Some(shell_args(&script)),
            env: Some(env),
            volume_mounts: Some(mounts),
            readiness_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "test".to_string(),
                        "-f".to_string(),
                        READY_MARKER.to_string(),
                    ]),
                }),
                period_seconds: Some(PROBE_PERIOD_SECS),
                failure_threshold: Some(PROBE_FAILURE_THRESHOLD),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), "boombox".to_string()),
                (USER_LABEL.to_string(), name.to_string()),
            ])),
            ..Default::default()
        }
    }
}

fn render(template: &str, username: &str) -> String {
    template
        .replace("{Username}", username)
        .replace("{UID}", &USER_UID.to_string())
        .replace("{ReadyMarker}", READY_MARKER)
}

fn shell_args(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn home_mount() -> VolumeMount {
    VolumeMount {
        name: HOME_VOLUME.to_string(),
        mount_path: "/home".to_string(),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}
