use std::path::PathBuf;

use amapiano_host::plugin::{
    MemorySource, PluginCategory, PluginDescriptor, PluginFormat, ScriptManifest, LOG_DRUM_SYNTH, PARAMETRIC_EQ,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "amapiano-host")]
#[command(about = "Real-time plugin host with a 5-band EQ and a log drum synthesizer")]
pub struct Cli {
    /// Host configuration file (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a sine through the equalizer and report the level change
    RenderEq {
        /// Factory preset to apply
        #[arg(long, default_value = "log-drum boost")]
        preset: String,
        /// Sine frequency in Hz
        #[arg(long, default_value_t = 60.0)]
        frequency: f32,
        /// Sine amplitude
        #[arg(long, default_value_t = 0.5)]
        amplitude: f32,
        /// Number of frames to render
        #[arg(long, default_value_t = 128)]
        frames: usize,
    },
    /// Play one note on the log drum and report the output level
    RenderDrum {
        /// MIDI note number
        #[arg(long, default_value_t = 48)]
        note: u8,
        /// Note-on velocity
        #[arg(long, default_value_t = 100)]
        velocity: u8,
        /// How long the note is held, in seconds
        #[arg(long, default_value_t = 0.25)]
        hold: f32,
        /// Total render length, in seconds
        #[arg(long, default_value_t = 1.0)]
        seconds: f32,
        /// Factory preset to apply first
        #[arg(long)]
        preset: Option<String>,
    },
    /// Print a plugin's factory presets as JSON
    Presets {
        #[arg(value_enum)]
        plugin: BuiltinPlugin,
    },
    /// Print a plugin's descriptor and parameters as JSON
    Describe {
        #[arg(value_enum)]
        plugin: BuiltinPlugin,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BuiltinPlugin {
    Eq,
    Drum,
}

const EQ_ARTIFACT: &str = "builtin/parametric-eq.toml";
const DRUM_ARTIFACT: &str = "builtin/log-drum.toml";

impl BuiltinPlugin {
    pub fn descriptor(self) -> PluginDescriptor {
        let mut descriptor = match self {
            BuiltinPlugin::Eq => PluginDescriptor::new(
                "amapiano-eq",
                "Amapiano EQ",
                PluginCategory::Effect,
                PluginFormat::Interpreted,
                EQ_ARTIFACT,
            ),
            BuiltinPlugin::Drum => PluginDescriptor::new(
                "log-drum",
                "Log Drum",
                PluginCategory::Instrument,
                PluginFormat::Interpreted,
                DRUM_ARTIFACT,
            ),
        };
        descriptor.author = "MACHIKO LAB".to_string();
        descriptor.cultural_context = Some("amapiano".to_string());
        descriptor.license = "AGPL-3.0-or-later".to_string();
        descriptor
    }
}

/// Script manifests for the bundled units, served from memory.
pub fn builtin_source() -> Result<MemorySource, String> {
    Ok(MemorySource::new()
        .with_artifact(EQ_ARTIFACT, ScriptManifest::new(PARAMETRIC_EQ).to_toml()?)
        .with_artifact(DRUM_ARTIFACT, ScriptManifest::new(LOG_DRUM_SYNTH).to_toml()?))
}
