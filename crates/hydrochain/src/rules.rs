//! Program rules keyed on the [`Program`] tag: directory naming, calendar
//! coordinates, job naming, processor counts and versions.

use crate::config::Settings;
use crate::model::{Case, Program};
use std::path::{Component, Path, PathBuf};

/// Calendar position and program decoded from a case directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseCoordinates {
    pub program: Program,
    pub year: i32,
    pub month: u32,
    pub revision: u32,
}

/// Decodes `<YYYY>_<MM>_rv<N>/<program dir>`.
///
/// The last component names the program through the configured directory
/// names; its parent carries the calendar coordinates.
pub fn parse_case_path(path: &Path, settings: &Settings) -> Result<CaseCoordinates, String> {
    let mut components = path.components().rev().filter_map(|c| match c {
        Component::Normal(s) => s.to_str(),
        _ => None,
    });

    let program_dir = components
        .next()
        .ok_or_else(|| format!("empty case path: {}", path.display()))?;
    let program = if program_dir == settings.long_horizon_dir_name {
        Program::LongHorizon
    } else if program_dir == settings.short_horizon_dir_name {
        Program::ShortHorizon
    } else {
        return Err(format!(
            "{}: directory `{program_dir}` is neither `{}` nor `{}`",
            path.display(),
            settings.long_horizon_dir_name,
            settings.short_horizon_dir_name
        ));
    };

    let stamp = components
        .next()
        .ok_or_else(|| format!("{}: missing <YYYY>_<MM>_rv<N> directory", path.display()))?;
    let (year, month, revision) = parse_stamp(stamp)
        .ok_or_else(|| format!("{}: `{stamp}` is not <YYYY>_<MM>_rv<N>", path.display()))?;

    if program == Program::LongHorizon && revision != 0 {
        return Err(format!(
            "{}: long-horizon cases are monthly and must be rv0",
            path.display()
        ));
    }

    Ok(CaseCoordinates {
        program,
        year,
        month,
        revision,
    })
}

fn parse_stamp(stamp: &str) -> Option<(i32, u32, u32)> {
    let mut parts = stamp.split('_');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let rv = parts.next()?;
    if parts.next().is_some() || !(1..=12).contains(&month) {
        return None;
    }
    let digits = rv.get(..2).filter(|p| p.eq_ignore_ascii_case("rv")).map(|_| &rv[2..])?;
    let revision: u32 = digits.parse().ok()?;
    Some((year, month, revision))
}

/// Scheduler-safe display name, e.g. `decomp_2020_01_rv1`.
pub fn case_name(coords: &CaseCoordinates, settings: &Settings) -> String {
    format!(
        "{}_{:04}_{:02}_rv{}",
        program_dir(coords.program, settings),
        coords.year,
        coords.month,
        coords.revision
    )
}

pub fn program_dir(program: Program, settings: &Settings) -> &str {
    match program {
        Program::LongHorizon => &settings.long_horizon_dir_name,
        Program::ShortHorizon => &settings.short_horizon_dir_name,
    }
}

/// Program name used in auxiliary service payloads.
pub fn wire_name(program: Program, settings: &Settings) -> &str {
    settings.program_names.get(program)
}

pub fn version(program: Program, settings: &Settings) -> &str {
    match program {
        Program::LongHorizon => &settings.long_horizon_version,
        Program::ShortHorizon => &settings.short_horizon_version,
    }
}

/// Variables chained into a case of `program`.
pub fn chaining_variables(_program: Program, settings: &Settings) -> &[String] {
    &settings.chaining_vars
}

/// Everything needed to create a Run for a case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub working_dir: PathBuf,
    pub program: Program,
    pub version: String,
    pub processors: u32,
    pub executable: PathBuf,
    pub args: Vec<String>,
}

pub fn run_spec(case: &Case, base_path: &Path, settings: &Settings) -> RunSpec {
    let version = version(case.program, settings).to_string();
    RunSpec {
        name: case.name.clone(),
        working_dir: case.absolute_path(base_path),
        program: case.program,
        processors: *settings.processors_per_program.get(case.program),
        executable: settings.executables.get(case.program).clone(),
        args: vec![version.clone()],
        version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CaseState;

    fn settings() -> Settings {
        Settings::new("pmo", "/data/pmo")
    }

    #[test]
    fn test_parse_short_horizon_case() {
        let coords = parse_case_path(Path::new("2020_01_rv1/decomp"), &settings()).unwrap();
        assert_eq!(
            coords,
            CaseCoordinates {
                program: Program::ShortHorizon,
                year: 2020,
                month: 1,
                revision: 1,
            }
        );
        assert_eq!(case_name(&coords, &settings()), "decomp_2020_01_rv1");
    }

    #[test]
    fn test_parse_long_horizon_case_nested() {
        let coords =
            parse_case_path(Path::new("estudo/2020_02_RV0/newave"), &settings()).unwrap();
        assert_eq!(coords.program, Program::LongHorizon);
        assert_eq!((coords.year, coords.month, coords.revision), (2020, 2, 0));
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        let s = settings();
        assert!(parse_case_path(Path::new("2020_01_rv1/dessem"), &s).is_err());
        assert!(parse_case_path(Path::new("decomp"), &s).is_err());
        assert!(parse_case_path(Path::new("2020_13_rv1/decomp"), &s).is_err());
        assert!(parse_case_path(Path::new("2020_01_x1/decomp"), &s).is_err());
        assert!(parse_case_path(Path::new("2020_01_rv2/newave"), &s).is_err());
    }

    #[test]
    fn test_run_spec_uses_program_rules() {
        let s = settings();
        let case = Case {
            id: 3,
            study_id: 1,
            path: PathBuf::from("2020_01_rv1/decomp"),
            name: "decomp_2020_01_rv1".into(),
            year: 2020,
            month: 1,
            revision: 1,
            program: Program::ShortHorizon,
            state: CaseState::Prepared,
            run_ids: vec![],
        };
        let spec = run_spec(&case, Path::new("/data/pmo"), &s);
        assert_eq!(spec.working_dir, PathBuf::from("/data/pmo/2020_01_rv1/decomp"));
        assert_eq!(spec.processors, s.processors_per_program.short_horizon);
        assert_eq!(spec.version, s.short_horizon_version);
        assert_eq!(spec.args, vec![s.short_horizon_version.clone()]);
        assert_eq!(wire_name(Program::ShortHorizon, &s), "DECOMP");
    }
}
