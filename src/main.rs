mod cli;

use std::f32::consts::TAU;
use std::sync::Arc;

use amapiano_host::plugin::{LoaderSet, UnitRegistry};
use amapiano_host::{AudioBuffer, HostConfig, MidiEvent, PluginHost, RenderContext, RenderGraph};
use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{builtin_source, BuiltinPlugin, Cli, Commands};

struct Session {
    host: PluginHost,
    graph: RenderGraph,
    context: RenderContext,
    channels: usize,
}

impl Session {
    fn new(config: HostConfig) -> Result<Self> {
        let source = builtin_source().map_err(anyhow::Error::msg)?;
        let loaders = LoaderSet::new(Arc::new(source), Arc::new(UnitRegistry::with_builtin()));
        let context = RenderContext::new(config.sample_rate, config.max_block_size);
        let channels = config.channels;
        let (host, graph) = PluginHost::new(config, loaders)?;
        Ok(Self {
            host,
            graph,
            context,
            channels,
        })
    }

    /// Load a bundled plugin and wire it between input and output.
    async fn insert(&self, plugin: BuiltinPlugin) -> Result<String> {
        let info = self.host.load_plugin(plugin.descriptor()).await?;
        let plugin_id = info.metadata.id;
        self.host.connect_plugin(&plugin_id, "input", "output")?;
        Ok(plugin_id)
    }

    /// Render `input` (mono) in blocks of at most the configured size.
    ///
    /// `events` are absolute sample positions; each is delivered in the block it falls in.
    fn render(&mut self, input: &[f32], events: &[(usize, MidiEvent)]) -> Vec<Vec<f32>> {
        let block = self.graph.max_block_size();
        let mut rendered = vec![Vec::with_capacity(input.len()); self.channels];
        let mut outputs = vec![vec![0.0f32; block]; self.channels];
        self.context.is_playing = true;

        for (index, chunk) in input.chunks(block).enumerate() {
            let start = index * block;
            let midi: Vec<MidiEvent> = events
                .iter()
                .filter(|(position, _)| (start..start + chunk.len()).contains(position))
                .map(|(position, event)| MidiEvent {
                    timestamp: (position - start) as u32,
                    ..*event
                })
                .collect();

            let inputs: Vec<&[f32]> = (0..self.channels).map(|_| chunk).collect();
            let mut slices: Vec<&mut [f32]> = outputs.iter_mut().map(|channel| &mut channel[..chunk.len()]).collect();
            self.context.buffer_size = chunk.len();
            let frames = self.graph.render(&inputs, &mut slices, &self.context, &midi);
            self.context.advance(frames);

            for (channel, output) in outputs.iter().enumerate() {
                rendered[channel].extend_from_slice(&output[..frames]);
            }
        }

        for report in self.host.poll_render_events() {
            eprintln!("Fault in {}: {}", report.plugin_id, report.reason);
        }
        rendered
    }
}

fn levels(channels: &[Vec<f32>]) -> (f32, f32) {
    let slices: Vec<&[f32]> = channels.iter().map(Vec::as_slice).collect();
    let buffer = AudioBuffer::from_channels(&slices);
    (buffer.rms(), buffer.peak())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HostConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => HostConfig::default(),
    };
    let sample_rate = config.sample_rate;
    let mut session = Session::new(config)?;

    match cli.command {
        Commands::RenderEq {
            preset,
            frequency,
            amplitude,
            frames,
        } => {
            let plugin_id = session.insert(BuiltinPlugin::Eq).await?;
            session.host.load_factory_preset(&plugin_id, &preset)?;

            let input: Vec<f32> = (0..frames)
                .map(|i| amplitude * (TAU * frequency * i as f32 / sample_rate).sin())
                .collect();
            let output = session.render(&input, &[]);

            let (input_rms, _) = levels(&[input]);
            let (output_rms, output_peak) = levels(&output);
            println!("Preset:      {}", preset);
            println!("Input RMS:   {:.6}", input_rms);
            println!("Output RMS:  {:.6}", output_rms);
            println!("Output peak: {:.6}", output_peak);
            if input_rms > 0.0 {
                println!("Ratio:       {:.4}", output_rms / input_rms);
            }
        }

        Commands::RenderDrum {
            note,
            velocity,
            hold,
            seconds,
            preset,
        } => {
            if seconds <= 0.0 || hold < 0.0 {
                bail!("seconds must be positive and hold non-negative");
            }
            let plugin_id = session.insert(BuiltinPlugin::Drum).await?;
            if let Some(preset) = &preset {
                session.host.load_factory_preset(&plugin_id, preset)?;
            }

            let frames = (seconds * sample_rate) as usize;
            let release_at = (hold * sample_rate) as usize;
            let events = [
                (0, MidiEvent::note_on(note, velocity, 0)),
                (release_at, MidiEvent::note_off(note, 0)),
            ];
            let output = session.render(&vec![0.0; frames], &events);

            let (rms, peak) = levels(&output);
            println!("Note:   {} (velocity {})", note, velocity);
            println!("Frames: {}", frames);
            println!("RMS:    {:.6}", rms);
            println!("Peak:   {:.6}", peak);
        }

        Commands::Presets { plugin } => {
            let info = session.host.load_plugin(plugin.descriptor()).await?;
            let presets = session.host.factory_presets(&info.metadata.id)?;
            println!("{}", serde_json::to_string_pretty(&presets)?);
        }

        Commands::Describe { plugin } => {
            let descriptor = plugin.descriptor();
            let info = session.host.load_plugin(descriptor.clone()).await?;
            let description = serde_json::json!({
                "descriptor": descriptor,
                "plugin": info,
            });
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
    }

    Ok(())
}
