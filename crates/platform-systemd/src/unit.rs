//! Service metadata retrieval: resolves the unit executing the current
//! process and describes it.

use std::fs;
use std::path::PathBuf;

use nix::unistd::{self, Uid};
use tracing::debug;
use vigil_service::{ServiceConfiguration, ServiceError, ServiceErrorKind};

/// The directories a unit file may live in, in lookup order.
const UNIT_DIRECTORIES: [&str; 4] = [
    "/etc/systemd/system",
    "/run/systemd/system",
    "/usr/lib/systemd/system",
    "/lib/systemd/system",
];

/// Reads the configuration of the service unit owning the current process.
pub(crate) fn retrieve() -> Result<ServiceConfiguration, ServiceError> {
    let cgroup = fs::read_to_string("/proc/self/cgroup").map_err(|error| {
        retrieval_error(format!("Failed to read the control group: {error}"))
    })?;
    let unit = unit_from_cgroup(&cgroup).ok_or_else(|| {
        retrieval_error("Failed to find the service unit for this process".to_owned())
    })?;

    let executable = std::env::current_exe()
        .map(|path| path.display().to_string())
        .map_err(|error| {
            retrieval_error(format!("Failed to resolve the executable path: {error}"))
        })?;

    let directories: Vec<PathBuf> = UNIT_DIRECTORIES.iter().copied().map(PathBuf::from).collect();
    let description = description_in(&directories, &unit).unwrap_or_default();

    Ok(ServiceConfiguration {
        name: unit,
        description,
        executable,
        user: current_user(),
    })
}

fn retrieval_error(detail: String) -> ServiceError {
    ServiceError::new(
        ServiceErrorKind::FailedToRetrieveConfiguration,
        format!("Failed to retrieve service configuration. {detail}."),
    )
}

/// Picks the `<name>.service` unit out of the process's cgroup paths.
///
/// Entries look like `0::/system.slice/foo.service`; templated and nested
/// slices put the unit in a deeper segment.
pub(crate) fn unit_from_cgroup(contents: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let path = line.splitn(3, ':').nth(2)?;
        path.rsplit('/')
            .find(|segment| segment.ends_with(".service"))
            .map(str::to_owned)
    })
}

/// Looks the unit file up across the given directories and reads its
/// description.
pub(crate) fn description_in(directories: &[PathBuf], unit: &str) -> Option<String> {
    for directory in directories {
        let path = directory.join(unit);
        match fs::read_to_string(&path) {
            Ok(contents) => return parse_description(&contents),
            Err(error) => {
                debug!(target: "vigil::systemd", "No unit file at {}: {error}", path.display());
            }
        }
    }
    None
}

/// Extracts `Description=` from the `[Unit]` section.
pub(crate) fn parse_description(contents: &str) -> Option<String> {
    let mut in_unit_section = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_unit_section = line.eq_ignore_ascii_case("[unit]");
            continue;
        }
        if !in_unit_section || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(value) = line.strip_prefix("Description=") {
            return Some(value.trim().to_owned());
        }
    }
    None
}

fn current_user() -> String {
    let uid = Uid::effective();
    match unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_service_unit_in_cgroup_paths() {
        let contents = "0::/system.slice/foo.service\n";
        assert_eq!(unit_from_cgroup(contents), Some("foo.service".to_owned()));

        let hybrid = "12:pids:/system.slice/bar.service\n1:name=systemd:/system.slice/bar.service\n";
        assert_eq!(unit_from_cgroup(hybrid), Some("bar.service".to_owned()));

        let nested = "0::/system.slice/system-template.slice/template@1.service\n";
        assert_eq!(
            unit_from_cgroup(nested),
            Some("template@1.service".to_owned())
        );
    }

    #[test]
    fn a_session_scope_is_not_a_service() {
        let contents = "0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(unit_from_cgroup(contents), None);
    }

    #[test]
    fn parses_the_unit_description() {
        let contents = "\
[Unit]
# A comment.
Description=An example service
After=network.target

[Service]
Description=Not this one
";
        assert_eq!(
            parse_description(contents),
            Some("An example service".to_owned())
        );
    }

    #[test]
    fn description_outside_the_unit_section_is_ignored() {
        let contents = "[Service]\nDescription=Wrong section\n";
        assert_eq!(parse_description(contents), None);
    }

    #[test]
    fn looks_the_unit_file_up_across_directories() {
        let empty = tempfile::tempdir().unwrap();
        let populated = tempfile::tempdir().unwrap();
        std::fs::write(
            populated.path().join("sample.service"),
            "[Unit]\nDescription=Sample unit\n",
        )
        .unwrap();

        let directories = vec![
            empty.path().to_path_buf(),
            populated.path().to_path_buf(),
        ];
        assert_eq!(
            description_in(&directories, "sample.service"),
            Some("Sample unit".to_owned())
        );
        assert_eq!(description_in(&directories, "absent.service"), None);
    }
}
