use super::*;
use butler::Stage;

#[test]
fn test_parse_bootstrap_flags() {
    let cli = Cli::try_parse_from([
        "butler",
        "bootstrap",
        "--config",
        "mgmt.yaml",
        "--status-port",
        "9090",
        "--non-interactive",
    ])
    .unwrap();

    match cli.command {
        Command::Bootstrap(args) => {
            assert_eq!(args.config.config, PathBuf::from("mgmt.yaml"));
            assert_eq!(args.status_port, Some(9090));
            assert!(args.non_interactive);
            assert!(!args.secure);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn test_parse_destroy_and_reject_unknown() {
    let cli = Cli::try_parse_from(["butler", "destroy", "-c", "mgmt.yaml", "--yes"]).unwrap();
    assert!(matches!(cli.command, Command::Destroy(DestroyArgs { yes: true, .. })));

    assert!(Cli::try_parse_from(["butler", "launch"]).is_err());
}

#[test]
fn test_exit_code_for_config_errors() {
    let err = anyhow::Error::from(ConfigError::NoNodeGroups);
    assert_eq!(exit_code(&err), EXIT_CONFIG);

    let err = anyhow::Error::from(BootstrapError::from(ConfigError::NoControlPlane));
    assert_eq!(exit_code(&err), EXIT_CONFIG);
}

#[test]
fn test_exit_code_for_cancelled_run() {
    let err = anyhow::Error::from(BootstrapError::at(Stage::AwaitingHealth, StepError::Cancelled));
    assert_eq!(exit_code(&err), EXIT_CANCELLED);

    let err = anyhow::Error::from(StepError::Cancelled).context("failed to delete VMs");
    assert_eq!(exit_code(&err), EXIT_CANCELLED);
}

#[test]
fn test_exit_code_for_stage_failure() {
    let err = anyhow::Error::from(BootstrapError::at(
        Stage::InstallingCni,
        StepError::invariant("no node reports an internal IP"),
    ));
    assert_eq!(exit_code(&err), 1);
}

#[tokio::test]
async fn test_destroy_without_confirmation_is_refused() {
    let args = DestroyArgs {
        config: ConfigArgs {
            config: PathBuf::from("missing.yaml"),
        },
        yes: false,
    };

    let err = destroy(args).await.unwrap_err();
    assert!(err.to_string().contains("--yes"));
}
