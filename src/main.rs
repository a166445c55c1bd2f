use std::path::{Path, PathBuf};

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};

use seamloop::loops::{
    CancellationToken, LengthPreference, LoopCandidate, LoopDetector, SearchStrategy, SearchWindow,
};
use seamloop::trim::{ResizeStrategy, TrimOptions, VideoTrimmer};
use seamloop::util::{self, Capabilities};
use seamloop::video::{FfmpegFrameSource, FrameSource};

fn parse_time_arg(s: &str) -> Result<f64, String> {
    util::parse_time_string(s).map_err(|e| e.to_string())
}

fn parse_length_arg(s: &str) -> Result<LengthPreference, String> {
    s.parse()
}

fn parse_resolution_arg(s: &str) -> Result<(u32, u32), String> {
    let invalid = || format!("invalid resolution {:?}: expected WIDTHxHEIGHT", s);
    let (width, height) = s.split_once('x').ok_or_else(invalid)?;
    let width: u32 = width.parse().map_err(|_| invalid())?;
    let height: u32 = height.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about seamloop, its dependencies, and a video file.")]
    Info {
        #[clap(
            value_parser = clap::value_parser!(PathBuf),
            help = "Video file to inspect. When omitted, only host capabilities are shown."
        )]
        path: Option<PathBuf>,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Analyze a video for seamless loops and print the top candidates without writing any output video."
    )]
    Detect {
        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video file to analyze."
        )]
        input: PathBuf,

        #[clap(
            long,
            default_value = "auto",
            value_parser = parse_length_arg,
            help = "Desired loop length in seconds, or \"auto\" for the best match."
        )]
        length: LengthPreference,

        #[clap(
            long,
            default_value_t = 98,
            value_parser = clap::value_parser!(u8),
            help = "Match threshold for similar frames, as a percentage (0-100)."
        )]
        similarity: u8,

        #[clap(
            long,
            value_parser = parse_time_arg,
            help = "Starting time for loop detection (supports HH:MM:SS, MM:SS, or seconds)."
        )]
        start: Option<f64>,

        #[clap(
            long,
            value_parser = parse_time_arg,
            help = "Stop time to limit the detection window (supports HH:MM:SS, MM:SS, or seconds)."
        )]
        stop: Option<f64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(u64),
            help = "Start frame (overrides --start if both are given)."
        )]
        start_frame: Option<u64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(u64),
            help = "Stop frame (overrides --stop if both are given)."
        )]
        stop_frame: Option<u64>,

        #[clap(
            long,
            value_enum,
            default_value_t = SearchStrategy::Hybrid,
            help = "Frame comparison method."
        )]
        method: SearchStrategy,

        #[clap(
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(u32),
            help = "Analyze every Nth frame for faster processing (1 = all frames)."
        )]
        downsample: u32,

        #[clap(
            long,
            default_value_t = 5,
            value_parser = clap::value_parser!(usize),
            help = "Number of candidates to display."
        )]
        top: usize,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Print the full candidate list as JSON instead of a summary."
        )]
        json: bool,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Detect the best seamless loop in a video and cut it out as a new clip. A JSON metadata sidecar describing the loop is written next to each output file."
    )]
    Create {
        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video file to analyze."
        )]
        input: PathBuf,

        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Path for the output video file."
        )]
        output: PathBuf,

        #[clap(
            long,
            default_value = "auto",
            value_parser = parse_length_arg,
            help = "Desired loop length in seconds, or \"auto\" for the best match."
        )]
        length: LengthPreference,

        #[clap(
            long,
            value_parser = clap::value_parser!(f64),
            help = "Desired final output duration in seconds; the source length needed is derived from --speed. Cannot be combined with --length."
        )]
        output_length: Option<f64>,

        #[clap(
            long,
            default_value_t = 0.0,
            value_parser = clap::value_parser!(f64),
            help = "Extra seconds included both before and after the loop."
        )]
        buffer: f64,

        #[clap(
            long,
            value_parser = clap::value_parser!(f64),
            help = "Extra seconds included before the loop start (overrides --buffer)."
        )]
        buffer_start: Option<f64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(f64),
            help = "Extra seconds included after the loop end (overrides --buffer)."
        )]
        buffer_stop: Option<f64>,

        #[clap(
            long,
            default_value_t = 98,
            value_parser = clap::value_parser!(u8),
            help = "Match threshold for similar frames, as a percentage (0-100)."
        )]
        similarity: u8,

        #[clap(
            long,
            value_parser = parse_time_arg,
            help = "Starting time for loop detection (supports HH:MM:SS, MM:SS, or seconds)."
        )]
        start: Option<f64>,

        #[clap(
            long,
            value_parser = parse_time_arg,
            help = "Stop time to limit the detection window (supports HH:MM:SS, MM:SS, or seconds)."
        )]
        stop: Option<f64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(u64),
            help = "Start frame (overrides --start if both are given)."
        )]
        start_frame: Option<u64>,

        #[clap(
            long,
            value_parser = clap::value_parser!(u64),
            help = "Stop frame (overrides --stop if both are given)."
        )]
        stop_frame: Option<u64>,

        #[clap(
            long,
            value_enum,
            default_value_t = SearchStrategy::Hybrid,
            help = "Frame comparison method."
        )]
        method: SearchStrategy,

        #[clap(
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(u32),
            help = "Analyze every Nth frame for faster processing (1 = all frames)."
        )]
        downsample: u32,

        #[clap(
            long,
            value_parser = parse_resolution_arg,
            help = "Output resolution, e.g. 1920x1080. Defaults to the source resolution."
        )]
        resolution: Option<(u32, u32)>,

        #[clap(
            long,
            value_enum,
            default_value_t = ResizeStrategy::Center,
            help = "Strategy for resolution mismatch."
        )]
        resize_strategy: ResizeStrategy,

        #[clap(
            long,
            default_value_t = 1.0,
            value_parser = clap::value_parser!(f64),
            help = "Playback speed multiplier (1.0 = normal)."
        )]
        speed: f64,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Exclude audio from the output."
        )]
        no_audio: bool,

        #[clap(
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(usize),
            help = "Number of different loops to create from the video (1-10)."
        )]
        loop_count: usize,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Do not write the JSON metadata sidecar."
        )]
        no_save_metadata: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Enable multi-threaded decoding in FFmpeg."
        )]
        threaded_decoding: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "Disable multi-threading."
    )]
    no_threading: bool,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "By default, video files are validated using FFmpeg, which is extremely accurate. Setting this flag will switch to just checking file headers."
    )]
    file_headers_only: bool,
}

impl Cli {
    fn validate(&self) {
        let mut cmd = Cli::command();
        match &self.command {
            Commands::Info { .. } => (),
            Commands::Detect {
                similarity,
                downsample,
                ..
            } => {
                if *similarity > 100 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "similarity must be between 0 and 100",
                    )
                    .exit();
                }
                if *downsample < 1 {
                    cmd.error(ErrorKind::InvalidValue, "downsample must be at least 1")
                        .exit();
                }
            }
            Commands::Create {
                similarity,
                downsample,
                speed,
                loop_count,
                length,
                output_length,
                ..
            } => {
                if *similarity > 100 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "similarity must be between 0 and 100",
                    )
                    .exit();
                }
                if *downsample < 1 {
                    cmd.error(ErrorKind::InvalidValue, "downsample must be at least 1")
                        .exit();
                }
                if *speed <= 0.0 {
                    cmd.error(ErrorKind::InvalidValue, "speed must be positive")
                        .exit();
                }
                if !(1..=10).contains(loop_count) {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "loop_count must be between 1 and 10",
                    )
                    .exit();
                }
                if let Some(output_length) = output_length {
                    if *output_length <= 0.0 {
                        cmd.error(ErrorKind::InvalidValue, "output_length must be positive")
                            .exit();
                    }
                    if *length != LengthPreference::Auto {
                        cmd.error(
                            ErrorKind::ArgumentConflict,
                            "cannot specify both --length and --output-length",
                        )
                        .exit();
                    }
                }
            }
        }
    }

    fn check_video_file(&self, path: &Path) {
        if !util::is_valid_video_file(path, !self.file_headers_only) {
            let mut cmd = Cli::command();
            cmd.error(
                ErrorKind::InvalidValue,
                format!("not a valid video file: {}", path.display()),
            )
            .exit();
        }
    }
}

#[derive(serde::Serialize)]
struct ProcessingOptions {
    similarity_threshold: u8,
    method: SearchStrategy,
    stride: u32,
    buffer_start: f64,
    buffer_stop: f64,
    resolution: Option<String>,
    speed: f64,
    include_audio: bool,
    resize_strategy: ResizeStrategy,
    loop_count: usize,
    loop_index: usize,
}

#[derive(serde::Serialize)]
struct LoopMetadata<'a> {
    seamloop_version: &'static str,
    input_file: &'a Path,
    output_file: &'a Path,
    input_md5: &'a str,
    loop_info: &'a LoopCandidate,
    processing_options: &'a ProcessingOptions,
}

fn print_loop_summary(candidates: &[LoopCandidate], top: usize) {
    if candidates.is_empty() {
        println!("No loops detected.");
        return;
    }

    println!("\nFound {} loop candidate(s):", candidates.len());
    println!("{}", "-".repeat(70));
    for (index, candidate) in candidates.iter().take(top).enumerate() {
        println!("Loop {}: {}", index + 1, candidate);
    }
    if candidates.len() > top {
        println!("... and {} more candidates", candidates.len() - top);
    }
}

// Appends `_loopNN` to the output stem when more than one loop is requested.
fn numbered_output(output: &Path, index: usize, loop_count: usize) -> PathBuf {
    if loop_count == 1 {
        return output.to_owned();
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let mut name = format!("{}_loop{:02}", stem, index + 1);
    if let Some(ext) = output.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    output.with_file_name(name)
}

#[allow(clippy::too_many_arguments)]
fn run_detection(
    input: &Path,
    window: SearchWindow,
    length: LengthPreference,
    similarity: u8,
    method: SearchStrategy,
    downsample: u32,
    threading: bool,
    threaded_decoding: bool,
) -> seamloop::Result<Vec<LoopCandidate>> {
    let mut source = FfmpegFrameSource::open(input)?.with_threaded_decoding(threaded_decoding);
    let info = source.info();
    println!(
        "Analyzing {} ({}x{}, {:.2} fps, {})",
        input.display(),
        info.width,
        info.height,
        info.fps,
        util::format_duration(info.duration),
    );

    let detector = LoopDetector::default()
        .with_window(window)
        .with_stride(downsample)
        .with_threshold(f32::from(similarity) / 100.0)
        .with_desired_length(length)
        .with_strategy(method)
        .with_threading(threading);
    detector.detect_loops(&mut source, &CancellationToken::new())
}

fn main() -> seamloop::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    ffmpeg_next::init()?;

    // Set a high FFmpeg log level to reduce logging verbosity.
    ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Fatal);

    let args = Cli::parse();
    args.validate();

    match args.command {
        Commands::Info { ref path } => {
            let capabilities = Capabilities::detect();
            println!("seamloop {}", env!("CARGO_PKG_VERSION"));
            println!("FFmpeg version: {}", capabilities.ffmpeg_version);
            println!("CPU threads: {}", capabilities.cpu_threads);
            println!(
                "Threaded analysis: {}",
                if capabilities.threading_enabled && !args.no_threading {
                    "enabled"
                } else {
                    "disabled"
                }
            );

            if let Some(path) = path {
                args.check_video_file(path);
                let source = FfmpegFrameSource::open(path)?;
                let info = source.info();
                println!("\n{}", path.display());
                println!("Duration: {}", util::format_duration(info.duration));
                println!("Frames: {}", info.total_frames);
                println!("Frame rate: {:.2} fps", info.fps);
                println!("Resolution: {}x{}", info.width, info.height);
            }
        }

        Commands::Detect {
            ref input,
            length,
            similarity,
            start,
            stop,
            start_frame,
            stop_frame,
            method,
            downsample,
            top,
            json,
        } => {
            args.check_video_file(input);
            let window = SearchWindow {
                start_frame,
                end_frame: stop_frame,
                start_time: start,
                end_time: stop,
            };
            let candidates = run_detection(
                input,
                window,
                length,
                similarity,
                method,
                downsample,
                !args.no_threading,
                false,
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&candidates)?);
            } else {
                print_loop_summary(&candidates, top);
            }
        }

        Commands::Create {
            ref input,
            ref output,
            length,
            output_length,
            buffer,
            buffer_start,
            buffer_stop,
            similarity,
            start,
            stop,
            start_frame,
            stop_frame,
            method,
            downsample,
            resolution,
            resize_strategy,
            speed,
            no_audio,
            loop_count,
            no_save_metadata,
            threaded_decoding,
        } => {
            args.check_video_file(input);

            // A target output duration at a given speed maps to a source-length
            // preference: output_length * speed seconds of source play back in
            // output_length seconds.
            let desired_length = match output_length {
                Some(output_length) => LengthPreference::Seconds(output_length * speed),
                None => length,
            };

            let window = SearchWindow {
                start_frame,
                end_frame: stop_frame,
                start_time: start,
                end_time: stop,
            };
            let candidates = run_detection(
                input,
                window,
                desired_length,
                similarity,
                method,
                downsample,
                !args.no_threading,
                threaded_decoding,
            )?;

            if candidates.is_empty() {
                eprintln!("No suitable loops found. Try adjusting parameters:");
                eprintln!("  - Lower similarity threshold (--similarity)");
                eprintln!("  - Different time range (--start, --stop)");
                eprintln!("  - Different comparison method (--method)");
                std::process::exit(1);
            }

            print_loop_summary(&candidates, 5);

            let loops_to_create = loop_count.min(candidates.len());
            if loops_to_create < loop_count {
                println!(
                    "Warning: only found {} suitable loop(s), creating {} instead of {}",
                    loops_to_create, loops_to_create, loop_count
                );
            }

            let options = TrimOptions {
                buffer_start: buffer_start.unwrap_or(buffer),
                buffer_end: buffer_stop.unwrap_or(buffer),
                resolution,
                speed,
                include_audio: !no_audio,
                resize_strategy,
            };
            let trimmer = VideoTrimmer::new();
            let input_md5 = util::compute_header_md5sum(input)?;

            for (index, candidate) in candidates.iter().take(loops_to_create).enumerate() {
                let current_output = numbered_output(output, index, loops_to_create);
                println!(
                    "Creating loop {}/{}: {} -> {}",
                    index + 1,
                    loops_to_create,
                    candidate,
                    current_output.display(),
                );

                trimmer.trim(input, &current_output, candidate, &options)?;

                if !trimmer.validate_output(&current_output) {
                    eprintln!(
                        "Warning: output validation failed for {}",
                        current_output.display()
                    );
                }

                if !no_save_metadata {
                    let processing_options = ProcessingOptions {
                        similarity_threshold: similarity,
                        method,
                        stride: downsample,
                        buffer_start: options.buffer_start,
                        buffer_stop: options.buffer_end,
                        resolution: resolution.map(|(w, h)| format!("{}x{}", w, h)),
                        speed,
                        include_audio: !no_audio,
                        resize_strategy,
                        loop_count,
                        loop_index: index + 1,
                    };
                    let metadata = LoopMetadata {
                        seamloop_version: env!("CARGO_PKG_VERSION"),
                        input_file: input,
                        output_file: &current_output,
                        input_md5: &input_md5,
                        loop_info: candidate,
                        processing_options: &processing_options,
                    };
                    let metadata_path = current_output.with_extension("json");
                    let mut f = std::fs::File::create(&metadata_path)?;
                    serde_json::to_writer_pretty(&mut f, &metadata)?;
                    println!("Loop metadata saved: {}", metadata_path.display());
                }
            }

            println!("Successfully created {} looped video(s).", loops_to_create);
        }
    }

    Ok(())
}
