//! Deterministic construction of the encoder command line.

use std::time::Duration;

use beam_media::registry::{Container, HwAccel};

use crate::route::{BitstreamFilter, Route};
use crate::transcode::validate::{validate_options, OptionKind};
use crate::Result;

/// Free-form option strings from the profile, validated before use.
#[derive(Debug, Clone, Default)]
pub struct EncoderOptions {
	pub input: Option<String>,
	pub output: Option<String>,
	pub filter_complex: Option<String>,
}

/// Everything needed to derive the encoder argv.
#[derive(Debug, Clone)]
pub struct CommandSpec {
	pub input_url: String,
	pub route: Route,
	pub hwaccel: HwAccel,
	pub options: EncoderOptions,
	/// fMP4 fragment duration for MP4-family outputs.
	pub fragment_duration: Duration,
}

/// Build the full argv (without the binary itself).
///
/// The output is a pure function of the spec: same spec, same argv, which
/// keeps route decisions reproducible and testable.
pub fn build_args(spec: &CommandSpec) -> Result<Vec<String>> {
	let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];

	// Hardware init has to precede the input.
	let accelerated = spec
		.route
		.video_encoder
		.as_deref()
		.map(is_hw_encoder)
		.unwrap_or(false);
	if accelerated {
		match spec.hwaccel {
			HwAccel::Cuda | HwAccel::Auto => {
				args.extend(["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"].map(String::from));
			}
			HwAccel::Qsv => args.extend(["-hwaccel", "qsv"].map(String::from)),
			HwAccel::Vaapi => {
				args.extend(
					["-hwaccel", "vaapi", "-vaapi_device", "/dev/dri/renderD128"].map(String::from),
				);
			}
			HwAccel::VideoToolbox => args.extend(["-hwaccel", "videotoolbox"].map(String::from)),
			HwAccel::None => {}
		}
	}

	if spec.input_url.starts_with("http://") || spec.input_url.starts_with("https://") {
		args.extend(
			[
				"-reconnect",
				"1",
				"-reconnect_streamed",
				"1",
				"-reconnect_delay_max",
				"2",
			]
			.map(String::from),
		);
	}

	if let Some(input) = &spec.options.input {
		args.extend(validate_options(OptionKind::Input, input)?);
	}

	args.push("-i".into());
	args.push(spec.input_url.clone());

	if let Some(filter) = &spec.options.filter_complex {
		let tokens = validate_options(OptionKind::FilterComplex, filter)?;
		args.push("-filter_complex".into());
		args.push(tokens.join(" "));
	} else if accelerated && matches!(spec.hwaccel, HwAccel::Vaapi) {
		// Frames must be uploaded to the device before a VAAPI encoder.
		args.extend(["-vf", "format=nv12,hwupload"].map(String::from));
	}

	// Codec selection. Copied video takes a bitstream filter when the NAL
	// framing changes; encoded video never does.
	match &spec.route.video_encoder {
		Some(encoder) => {
			args.push("-c:v".into());
			args.push(encoder.clone());
		}
		None if spec.route.variant.video.is_some() => {
			args.extend(["-c:v", "copy"].map(String::from));
			match spec.route.video_bsf {
				Some(BitstreamFilter::AvccToAnnexB) => {
					args.extend(["-bsf:v", "h264_mp4toannexb"].map(String::from));
				}
				Some(BitstreamFilter::AnnexBToAvcc) | None => {}
			}
		}
		None => {}
	}

	match &spec.route.audio_encoder {
		Some(encoder) => {
			args.push("-c:a".into());
			args.push(encoder.clone());
		}
		None if spec.route.variant.audio.is_some() => {
			args.extend(["-c:a", "copy"].map(String::from));
			if spec.route.strip_adts {
				args.extend(["-bsf:a", "aac_adtstoasc"].map(String::from));
			}
		}
		None => {}
	}

	if let Some(output) = &spec.options.output {
		args.extend(validate_options(OptionKind::Output, output)?);
	}

	// Container and timing policy.
	match spec.route.container {
		Container::Mp4 | Container::Fmp4 => {
			args.extend(["-f", "mp4"].map(String::from));
			args.push("-movflags".into());
			args.push("empty_moov+default_base_moof+skip_trailer+cmaf".into());
			args.push("-frag_duration".into());
			args.push(spec.fragment_duration.as_micros().to_string());
		}
		Container::MpegTs | Container::Hls => {
			args.extend(["-f", "mpegts"].map(String::from));
			args.extend(["-mpegts_start_pid", "256"].map(String::from));
			args.extend(["-mpegts_pmt_start_pid", "4096"].map(String::from));
			args.extend(["-copyts", "-avoid_negative_ts", "disabled"].map(String::from));
		}
		Container::Flv => args.extend(["-f", "flv"].map(String::from)),
		Container::Matroska => args.extend(["-f", "matroska"].map(String::from)),
		Container::WebM => args.extend(["-f", "webm"].map(String::from)),
	}

	args.push("pipe:1".into());
	Ok(args)
}

fn is_hw_encoder(name: &str) -> bool {
	["_nvenc", "_qsv", "_vaapi", "_videotoolbox", "_amf"]
		.iter()
		.any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::route::RouteType;
	use beam_media::registry::{AudioCodec, VideoCodec};
	use beam_media::Variant;

	fn transcode_route(container: Container, video: &str, audio: &str) -> Route {
		Route {
			kind: RouteType::Transcode,
			container,
			variant: Variant::new(VideoCodec::H264, AudioCodec::Aac),
			video_encoder: Some(video.to_string()),
			audio_encoder: Some(audio.to_string()),
			video_bsf: None,
			strip_adts: false,
		}
	}

	fn spec(route: Route) -> CommandSpec {
		CommandSpec {
			input_url: "http://upstream/live.ts".to_string(),
			route,
			hwaccel: HwAccel::None,
			options: EncoderOptions::default(),
			fragment_duration: Duration::from_secs(4),
		}
	}

	#[test]
	fn software_ts_transcode_argv() {
		let args = build_args(&spec(transcode_route(Container::MpegTs, "libx264", "aac"))).unwrap();
		let joined = args.join(" ");

		assert!(joined.contains("-reconnect 1"));
		assert!(joined.contains("-i http://upstream/live.ts"));
		assert!(joined.contains("-c:v libx264"));
		assert!(joined.contains("-c:a aac"));
		assert!(joined.contains("-f mpegts"));
		assert!(joined.contains("-mpegts_start_pid 256"));
		assert!(joined.contains("-mpegts_pmt_start_pid 4096"));
		assert!(joined.contains("-copyts"));
		assert!(!joined.contains("-hwaccel"));
		assert!(!joined.contains("-bsf"));
		assert_eq!(args.last().unwrap(), "pipe:1");
	}

	#[test]
	fn fmp4_transcode_argv() {
		let mut spec = spec(transcode_route(Container::Fmp4, "libsvtav1", "libopus"));
		spec.fragment_duration = Duration::from_millis(2000);
		let args = build_args(&spec).unwrap();
		let joined = args.join(" ");

		assert!(joined.contains("-f mp4"));
		assert!(joined.contains("-movflags empty_moov+default_base_moof+skip_trailer+cmaf"));
		assert!(joined.contains("-frag_duration 2000000"));
	}

	#[test]
	fn hw_encoder_gets_device_init_before_input() {
		let mut spec = spec(transcode_route(Container::MpegTs, "h264_nvenc", "aac"));
		spec.hwaccel = HwAccel::Cuda;
		let args = build_args(&spec).unwrap();

		let hw = args.iter().position(|a| a == "-hwaccel").unwrap();
		let input = args.iter().position(|a| a == "-i").unwrap();
		assert!(hw < input, "hwaccel init must precede the input");
	}

	#[test]
	fn vaapi_gets_an_upload_filter() {
		let mut spec = spec(transcode_route(Container::MpegTs, "h264_vaapi", "aac"));
		spec.hwaccel = HwAccel::Vaapi;
		let args = build_args(&spec).unwrap();
		let joined = args.join(" ");
		assert!(joined.contains("-vaapi_device /dev/dri/renderD128"));
		assert!(joined.contains("-vf format=nv12,hwupload"));
	}

	#[test]
	fn copy_mode_applies_bitstream_filters() {
		let route = Route {
			kind: RouteType::Repackage,
			container: Container::MpegTs,
			variant: Variant::new(VideoCodec::H264, AudioCodec::Aac),
			video_encoder: None,
			audio_encoder: None,
			video_bsf: Some(BitstreamFilter::AvccToAnnexB),
			strip_adts: false,
		};
		let args = build_args(&spec(route)).unwrap();
		let joined = args.join(" ");
		assert!(joined.contains("-c:v copy -bsf:v h264_mp4toannexb"));
	}

	#[test]
	fn adts_strip_applies_to_copied_aac() {
		let route = Route {
			kind: RouteType::Repackage,
			container: Container::Fmp4,
			variant: Variant::new(VideoCodec::H264, AudioCodec::Aac),
			video_encoder: None,
			audio_encoder: None,
			video_bsf: Some(BitstreamFilter::AnnexBToAvcc),
			strip_adts: true,
		};
		let args = build_args(&spec(route)).unwrap();
		let joined = args.join(" ");
		assert!(joined.contains("-c:a copy -bsf:a aac_adtstoasc"));
		// Annex B -> AVCC is the MP4 muxer's own job; no -bsf:v appears.
		assert!(!joined.contains("-bsf:v"));
	}

	#[test]
	fn user_options_are_validated_and_inserted() {
		let mut spec = spec(transcode_route(Container::MpegTs, "libx264", "aac"));
		spec.options.output = Some("-preset veryfast -g 48".to_string());
		let args = build_args(&spec).unwrap();
		let joined = args.join(" ");
		assert!(joined.contains("-preset veryfast -g 48"));

		spec.options.output = Some("-preset fast; reboot".to_string());
		assert!(build_args(&spec).is_err());
	}

	#[test]
	fn argv_is_deterministic() {
		let spec = spec(transcode_route(Container::MpegTs, "libx264", "aac"));
		let first = build_args(&spec).unwrap();
		for _ in 0..3 {
			assert_eq!(build_args(&spec).unwrap(), first);
		}
	}
}
