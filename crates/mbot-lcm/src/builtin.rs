//! The `mbot_lcm_msgs` namespace shipped with the bridge.
//!
//! Declaration order matters: trial-decode discovery walks it front to back.

use crate::directory::Namespace;
use crate::schema::{Primitive, TypeSchema};

pub const BUILTIN_NAMESPACE: &str = "mbot_lcm_msgs";

/// Schemas of the robot's standard bus messages.
pub fn namespace() -> Namespace {
    use Primitive::{Float, Int32, Int64};

    Namespace::new(BUILTIN_NAMESPACE)
        .with_type(
            TypeSchema::new("pose2D")
                .field("x", Float)
                .field("y", Float)
                .field("theta", Float),
        )
        .with_type(
            TypeSchema::new("twist2D")
                .field("vx", Float)
                .field("vy", Float)
                .field("wz", Float),
        )
        .with_type(TypeSchema::new("timestamp").field("utime", Int64))
        .with_type(
            TypeSchema::new("path2D")
                .field("utime", Int64)
                .field("path_length", Int32)
                .nested_array("path", "pose2D", "path_length"),
        )
        .with_type(
            TypeSchema::new("lidar")
                .field("utime", Int64)
                .field("num_ranges", Int32)
                .var_array("ranges", Float, "num_ranges")
                .var_array("thetas", Float, "num_ranges")
                .var_array("times", Int64, "num_ranges")
                .var_array("intensities", Float, "num_ranges"),
        )
        .with_type(
            TypeSchema::new("mbot_imu")
                .field("utime", Int64)
                .fixed_array("gyro", Float, 3)
                .fixed_array("accel", Float, 3)
                .fixed_array("mag", Float, 3)
                .fixed_array("tb", Float, 3)
                .field("temp", Float),
        )
        .with_type(
            TypeSchema::new("mbot_encoders")
                .field("utime", Int64)
                .fixed_array("ticks", Int64, 3)
                .fixed_array("delta_ticks", Int32, 3)
                .field("delta_time", Int32),
        )
        .with_type(
            TypeSchema::new("mbot_message_received")
                .field("utime", Int64)
                .field("creation_time", Int64)
                .field("channel", Primitive::String),
        )
}
