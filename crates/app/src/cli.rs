use clap::Parser;
use vision::VisionCliArgs;

/// Watch a camera or stream and annotate motion, detections, or tracked objects.
#[derive(Debug, Parser)]
#[command(name = "vision-monitor", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub vision: VisionCliArgs,
}

#[cfg(test)]
mod tests {
    use vision::{StageKind, VisionConfig};

    use super::*;

    #[test]
    fn positionals_follow_mode_source_method() {
        let cli = Cli::try_parse_from(["vision-monitor", "newest", "local", "rel_motion"]).unwrap();
        let config = VisionConfig::try_from(cli.vision).unwrap();
        assert_eq!(config.stage, StageKind::RelativeMotion);
        assert_eq!(config.source.to_string(), "/dev/video0");
    }

    #[test]
    fn missing_positionals_are_rejected() {
        assert!(Cli::try_parse_from(["vision-monitor", "queue"]).is_err());
    }
}
