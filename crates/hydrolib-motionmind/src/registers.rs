//! The MotionMind 3 register file.
//!
//! A static, read-only table shared by every driver instance. Position and
//! width must match the controller's firmware exactly: the batched READ
//! reply packs values in position order at these widths, with no
//! delimiters.

/// One named register: its bit position in the READ bitmask (also its
/// address for single-register operations) and its width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// Register name as used throughout the driver API.
    pub name: &'static str,
    /// Position 0-31; bit index in the batched-read mask.
    pub position: u8,
    /// Value width in bytes: 1, 2, or 4.
    pub width: usize,
}

/// The full register file, in position order.
pub static REGISTERS: &[RegisterDescriptor] = &[
    RegisterDescriptor { name: "position", position: 0, width: 4 },
    RegisterDescriptor { name: "velocity_limit", position: 1, width: 2 },
    RegisterDescriptor { name: "velocity_ff", position: 2, width: 1 },
    RegisterDescriptor { name: "function", position: 3, width: 2 },
    RegisterDescriptor { name: "p_term", position: 4, width: 2 },
    RegisterDescriptor { name: "i_term", position: 5, width: 2 },
    RegisterDescriptor { name: "d_term", position: 6, width: 2 },
    RegisterDescriptor { name: "address", position: 7, width: 1 },
    RegisterDescriptor { name: "pid_scalar", position: 8, width: 1 },
    RegisterDescriptor { name: "timer", position: 9, width: 1 },
    RegisterDescriptor { name: "rcmax", position: 10, width: 2 },
    RegisterDescriptor { name: "rcmin", position: 11, width: 2 },
    RegisterDescriptor { name: "rcband", position: 12, width: 2 },
    RegisterDescriptor { name: "rccount", position: 13, width: 2 },
    RegisterDescriptor { name: "velocity", position: 14, width: 2 },
    RegisterDescriptor { name: "time", position: 15, width: 4 },
    RegisterDescriptor { name: "status", position: 16, width: 2 },
    RegisterDescriptor { name: "revision", position: 17, width: 1 },
    RegisterDescriptor { name: "mode", position: 18, width: 1 },
    RegisterDescriptor { name: "analog_con", position: 19, width: 2 },
    RegisterDescriptor { name: "analog_fbck", position: 20, width: 2 },
    RegisterDescriptor { name: "pwm_out", position: 21, width: 2 },
    RegisterDescriptor { name: "index_pos", position: 22, width: 4 },
    RegisterDescriptor { name: "vir_neg_limit", position: 23, width: 4 },
    RegisterDescriptor { name: "vir_pos_limit", position: 24, width: 4 },
    RegisterDescriptor { name: "pwm_limit", position: 25, width: 2 },
    RegisterDescriptor { name: "deadband", position: 26, width: 2 },
    RegisterDescriptor { name: "desired_position", position: 27, width: 4 },
    RegisterDescriptor { name: "amps_limit", position: 28, width: 2 },
    RegisterDescriptor { name: "amps", position: 29, width: 2 },
    RegisterDescriptor { name: "function2", position: 30, width: 2 },
    RegisterDescriptor { name: "temperature", position: 31, width: 2 },
];

/// Look up a register by name.
pub fn register(name: &str) -> Option<&'static RegisterDescriptor> {
    REGISTERS.iter().find(|r| r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_complete_and_ordered() {
        assert_eq!(REGISTERS.len(), 32);
        for (i, reg) in REGISTERS.iter().enumerate() {
            assert_eq!(reg.position as usize, i, "table out of position order");
        }
    }

    #[test]
    fn widths_are_legal() {
        for reg in REGISTERS {
            assert!(
                matches!(reg.width, 1 | 2 | 4),
                "{} has illegal width {}",
                reg.name,
                reg.width
            );
        }
    }

    #[test]
    fn lookup_by_name() {
        let p_term = register("p_term").unwrap();
        assert_eq!(p_term.position, 4);
        assert_eq!(p_term.width, 2);

        assert_eq!(register("position").unwrap().width, 4);
        assert_eq!(register("velocity").unwrap().position, 14);
        assert!(register("flux_capacitor").is_none());
    }
}
