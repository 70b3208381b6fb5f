use glam::{Mat3, Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Ordinal of a decoded video frame. Indices increase monotonically but may skip.
pub type FrameIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl VideoCodec {
    /// Maps the codec id announced by the streaming server.
    pub fn from_wire(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::H264),
            1 => Some(Self::Hevc),
            2 => Some(Self::Av1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
}

/// Stream geometry reported by the network receiver once a server accepted us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub stream: StreamConfig,
    pub frame_queue_size: u32,
}

/// Settings pushed by the server while a stream is live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSettings {
    pub test_mode: bool,
    pub suspend: bool,
    pub frame_queue_size: u32,
}

/// Last server we streamed from, kept across sessions for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
}

/// Opaque handle of the decoder-owned texture that receives video frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u32);

/// Head pose captured at one instant.
///
/// `head_transform` (column-major head-from-world matrix) is authoritative;
/// `position` and `orientation` are the world-space decomposition sent over
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub position: [f32; 3],
    pub orientation: [f32; 4],
    pub head_transform: [f32; 16],
    pub capture_time_ns: i64,
}

impl PoseSample {
    pub fn identity(capture_time_ns: i64) -> Self {
        Self {
            position: [0.0; 3],
            orientation: [0.0, 0.0, 0.0, 1.0],
            head_transform: Mat4::IDENTITY.to_cols_array(),
            capture_time_ns,
        }
    }

    /// Decomposes a head-from-world transform into world-space head position
    /// and orientation. `eye_height` is added to the vertical axis since the
    /// tracker reports positions relative to eye level.
    pub fn from_head_transform(head_from_world: Mat4, eye_height: f32, capture_time_ns: i64) -> Self {
        let world_rotation = Mat3::from_mat4(head_from_world).transpose();
        let orientation = Quat::from_mat3(&world_rotation).normalize();
        let translation = head_from_world.w_axis.truncate();
        let position = -(world_rotation * translation) + Vec3::Y * eye_height;

        Self {
            position: position.to_array(),
            orientation: orientation.to_array(),
            head_transform: head_from_world.to_cols_array(),
            capture_time_ns,
        }
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array(&self.head_transform)
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_array(self.orientation)
    }
}

/// Where the pose attached to a presented frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseOrigin {
    /// The pose recorded when the frame was requested.
    Correlated,
    /// No recorded pose was found; the most recent sample was used instead.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentedFrame {
    pub frame_index: FrameIndex,
    pub pose: PoseSample,
    pub pose_origin: PoseOrigin,
    pub texture: TextureHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: [f32; 3], b: [f32; 3]) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < 1e-4, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_identity_transform_decomposes_to_eye_height() {
        let pose = PoseSample::from_head_transform(Mat4::IDENTITY, 1.8, 7);
        assert_close(pose.position, [0.0, 1.8, 0.0]);
        assert_eq!(pose.orientation, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(pose.capture_time_ns, 7);
    }

    #[test]
    fn test_decomposition_recovers_world_pose() {
        let head_position = Vec3::new(1.0, 0.5, -2.0);
        let head_rotation = Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-0.2);
        let world_from_head = Mat4::from_rotation_translation(head_rotation, head_position);
        let head_from_world = world_from_head.inverse();

        let pose = PoseSample::from_head_transform(head_from_world, 0.0, 0);

        assert_close(pose.position, head_position.to_array());
        let recovered = pose.rotation();
        assert!(recovered.dot(head_rotation).abs() > 0.9999);
        assert_eq!(pose.transform(), head_from_world);
    }

    #[test]
    fn test_codec_from_wire() {
        assert_eq!(VideoCodec::from_wire(0), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_wire(1), Some(VideoCodec::Hevc));
        assert_eq!(VideoCodec::from_wire(9), None);
    }
}
